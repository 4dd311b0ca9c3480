// Utils

pub mod amqp;
pub mod metrics;

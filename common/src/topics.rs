pub const TOPIC_CONTROLLER_STATE: &str = "fridge/controller/state";
pub const TOPIC_CONTROLLER_STATUS: &str = "fridge/controller/status";

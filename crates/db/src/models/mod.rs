pub mod detection_log;
pub mod packing_event;
pub mod queue_item;

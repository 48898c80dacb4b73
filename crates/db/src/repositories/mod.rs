pub mod detection_log_repo;
pub mod packing_event_repo;
pub mod pipeline_state_repo;
pub mod queue_item_repo;

pub use detection_log_repo::DetectionLogRepo;
pub use packing_event_repo::PackingEventRepo;
pub use pipeline_state_repo::PipelineStateRepo;
pub use queue_item_repo::QueueItemRepo;

pub mod backup;
pub mod coordinator;
pub mod extractor;
pub mod job;
pub mod reconcile;
pub mod storage;

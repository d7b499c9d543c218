pub mod coordinator;
pub mod worker;

pub use coordinator::{ClientState, ReshardingCoordinatorClient};
pub use worker::{
    CoordinatorRecord, CoordinatorStatus, InMemoryReshardingWorker, ReshardingWorker, StatusChange,
};

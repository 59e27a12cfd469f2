// Copyright (c) Facebook, Inc. and its affiliates.
use thiserror::Error;

/// Fatal fault categories. Every fault aborts the run after
/// compensating teardown; none are retried except the single resource
/// class create retry.
#[derive(Debug, Error)]
pub enum Fault {
    #[error("configuration: {0}")]
    Configuration(String),

    #[error("resource class: {0}")]
    ResourceClass(String),

    #[error("process: {0}")]
    Process(String),

    #[error("telemetry: {0}")]
    Telemetry(String),

    #[error("monitored PID {0} vanished")]
    Vanished(i32),
}

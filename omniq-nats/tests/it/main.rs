#![cfg(feature = "integration-tests")]

mod helper;
mod queue;

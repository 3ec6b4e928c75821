//! End-to-end test support for the memory engine:
//! - `harness`: isolated engine instances over temporary databases
//! - `mocks`: deterministic capability stand-ins and data factories

pub mod harness;
pub mod mocks;

//! Data structures for roaster state.

pub mod machine_state;

pub use machine_state::MachineState;

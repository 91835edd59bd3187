pub mod heap;
pub mod runtime_error;
pub mod vm_bc;

pub use heap::{HEAP_BIT, Heap, HeapError};
pub use runtime_error::{FaultKind, MachineError};
pub use vm_bc::{
    EnvironmentState, ExecutionState, ExternalFunction, ExternalTable, Machine, MachineConfig,
};

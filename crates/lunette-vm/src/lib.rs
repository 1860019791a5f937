//! Lunette execution core: call frames, protected calls, coroutines, the
//! stack manager and the incremental/generational garbage collector.
//!
//! Instruction decoding is not part of this crate. Interpreted frames run
//! through an installed [`dispatch::Dispatcher`]; chunks are turned into
//! prototypes by a [`load::ChunkLoader`].

pub mod api;
pub mod call;
pub mod callinfo;
pub mod config;
pub mod coroutine;
pub mod dispatch;
pub mod error;
pub mod func;
pub mod gc;
pub mod heap;
pub mod hook;
pub mod load;
pub mod metamethod;
pub mod protect;
pub mod proto;
pub mod stack;
pub mod state;
pub mod thread;

pub use api::{upvalue_index, REGISTRY_INDEX};
pub use callinfo::{KContext, KFunction, NativeFn, MULTRET};
pub use config::{GcMode, VmConfig};
pub use error::{LuaError, LuaResult, Status};
pub use gc::{GcCommand, GcPhase, GcResponse};
pub use hook::{DebugInfo, HookEvent, HookFn, HookMask};
pub use load::{ChunkLoader, LoadMode};
pub use state::Vm;
pub use thread::{CoroutineStatus, StkId};

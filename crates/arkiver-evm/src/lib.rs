//! arkiver-evm — EVM chunk fetching, chain scheduling, and the engine
//! entry point.

pub mod arkive;
pub mod retry;
pub mod rpc;
pub mod scheduler;

pub use arkive::{Arkive, ArkiveBuilder, ShutdownHandle};
pub use retry::{RetryConfig, RetryPolicy};
pub use rpc::{ChunkFetcher, ChunkFilter, EvmRpcClient};
pub use scheduler::{ChainPipeline, ChainState, SchedulerConfig};

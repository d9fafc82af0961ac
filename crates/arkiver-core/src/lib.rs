//! arkiver-core — foundation for the declarative, reorg-safe event
//! indexing engine.
//!
//! # Architecture
//!
//! ```text
//! ArkiveConfig → registry::resolve → WatchSpecs (per chain)
//!                                        │
//! ChainPipeline (one per chain)          ▼
//!     ├── FactoryResolver   (creation events → AddressArena)
//!     ├── EventRouter       (items → ordered dispatch envelopes)
//!     ├── BlockTracker      (parent hash chain, reorg detection)
//!     ├── Dispatcher        (transformers, one entity tx per block)
//!     ├── CursorManager     (crash recovery)
//!     └── EntityStore       (memory / SQLite)
//! ```

pub mod abi;
pub mod config;
pub mod cursor;
pub mod dispatch;
pub mod error;
pub mod factory;
pub mod items;
pub mod key;
pub mod registry;
pub mod router;
pub mod store;
pub mod tracker;
pub mod watch;

pub use abi::{Abi, AbiEvent, AbiFunction, AbiParam, SignatureTable};
pub use config::{ArkiveConfig, BlockBound, ChainConfig, Factory, Sources};
pub use cursor::{Cursor, CursorManager, CursorStore, MemoryCursorStore};
pub use dispatch::{Dispatcher, Transformer, TransformerRegistry};
pub use error::{ArkiveError, ConfigError};
pub use factory::FactoryResolver;
pub use items::{ChunkData, Envelope};
pub use key::{Direction, DispatchKey};
pub use registry::{resolve, validate_keys};
pub use router::EventRouter;
pub use store::{EntityStore, EntityTx};
pub use tracker::{BlockTracker, ReorgEvent};
pub use watch::{AddressArena, WatchKind, WatchSpec};

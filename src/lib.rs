pub mod codec;
pub mod error;
pub mod index;
pub mod index_set;
pub mod lock;
pub mod log;
pub mod record;
pub mod serializer;
pub mod store;
pub mod value;

pub use error::{Error, Result};
pub use index::IndexDescriptor;
pub use log::{Sentinels, SortSpec};
pub use record::Record;
pub use store::{LogCallback, Logger, Store, StoreOptions};

pub(crate) mod bulk;
pub(crate) mod error;
pub(crate) mod harness;
pub(crate) mod heap;
pub(crate) mod layout;
pub(crate) mod page_cache;
pub(crate) mod page_pool;
pub(crate) mod page_source;
pub(crate) mod size_class;
pub(crate) mod stats;
pub(crate) mod vm;

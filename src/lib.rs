pub mod canon;
pub mod concurrent_list;
pub mod db;
pub mod densemap;
pub mod depfile;
pub mod fs;
pub mod graph;
pub mod hash;
pub mod scan;
pub mod showincludes;
pub mod smallmap;
pub mod status;
pub mod task;
pub mod thread_pool;
pub mod work;

#[cfg(not(windows))]
use jemallocator::Jemalloc;

#[cfg(not(windows))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

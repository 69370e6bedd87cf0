pub mod buffer_pool;
pub mod disk_manager;
pub mod errors;
pub mod hash;
pub mod indexes;
pub mod lock_manager;
pub mod logging;
pub mod pages;
pub mod tuple;
pub mod txn_manager;

#[cfg(test)]
pub(crate) fn init_test_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Routes the crate's `log` output through the test harness.
///
/// Silent unless `RUST_LOG` is set, e.g. `RUST_LOG=pagetree=debug`.
pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

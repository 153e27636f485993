/// Logs at warn severity the first time the call site fires and at info
/// severity afterwards. Keeps repeated client misbehavior from flooding the
/// log while still surfacing it once prominently.
#[macro_export]
macro_rules! warn_once_or_info {
    ($($t:tt)*) => {{
        static FIRED: std::sync::OnceLock<std::marker::PhantomData<bool>> =
            std::sync::OnceLock::new();
        log::log!(match FIRED.set(std::marker::PhantomData) {
            Ok(()) => log::Level::Warn,
            Err(_) => log::Level::Info,
        },$($t)*);
    }};
}

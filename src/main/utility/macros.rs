/// Panic in debug builds. In release builds, log an error and keep going.
macro_rules! debug_panic {
    ($($x:tt)+) => {
        log::error!($($x)+);
        if cfg!(debug_assertions) {
            panic!($($x)+);
        }
    };
}

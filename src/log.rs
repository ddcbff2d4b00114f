// Logging is optional.  With the `logging` feature (the default) these
// forward to the `log` crate; without it they vanish.

#[cfg(feature = "logging")]
macro_rules! debug {
  ($($arg:tt)*) => { ::log::debug!($($arg)*) };
}
#[cfg(feature = "logging")]
macro_rules! info {
  ($($arg:tt)*) => { ::log::info!($($arg)*) };
}
#[cfg(feature = "logging")]
macro_rules! warn {
  ($($arg:tt)*) => { ::log::warn!($($arg)*) };
}
#[cfg(feature = "logging")]
macro_rules! error {
  ($($arg:tt)*) => { ::log::error!($($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! debug {
  ($($arg:tt)*) => {{}};
}
#[cfg(not(feature = "logging"))]
macro_rules! info {
  ($($arg:tt)*) => {{}};
}
#[cfg(not(feature = "logging"))]
macro_rules! warn {
  ($($arg:tt)*) => {{}};
}
#[cfg(not(feature = "logging"))]
macro_rules! error {
  ($($arg:tt)*) => {{}};
}

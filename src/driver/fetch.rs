//! Result fetching strategies.
//! 结果获取策略。
//!
//! Once the query watcher sees the connection is no longer busy it asks a
//! [`FetchResult`] strategy for the final result. The strategy is chosen when
//! the client is built, so measuring the cost of a blocking fetch never needs
//! to patch the client at runtime.

use super::{Driver, DriverError, QueryResult};

/// Fetches the final result of a completed command.
pub trait FetchResult {
    fn fetch(&self, driver: &mut dyn Driver) -> Result<QueryResult, DriverError>;
}

/// Reads the last result directly. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastResult;

impl FetchResult for LastResult {
    fn fetch(&self, driver: &mut dyn Driver) -> Result<QueryResult, DriverError> {
        driver.get_last_result()
    }
}

/// Blocks on the driver until input is complete, then reads the last result.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockingLastResult;

impl FetchResult for BlockingLastResult {
    fn fetch(&self, driver: &mut dyn Driver) -> Result<QueryResult, DriverError> {
        driver.block()?;
        driver.get_last_result()
    }
}

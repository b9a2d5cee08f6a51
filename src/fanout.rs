//! 将一个大查询拆分到多个连接上并发执行。
//! Splits one large read across several connections.
//!
//! Each client fetches one contiguous slice of the result, all slices are in
//! flight at once, and the rows are merged back in slice order. The outcome
//! matches a single sequential query over the same range.
//!
//! 每个客户端获取结果中连续的一段，所有分段同时进行，行按分段顺序合并。

use crate::{
    client::Client,
    deferred::Deferred,
    driver::{Command, Row},
    error::Error,
};
use tracing::debug;

/// Fetches rows `0..total` using one slice per client.
///
/// `query(offset, limit)` builds the command for one slice. The first failing
/// slice fails the whole result.
pub fn fetch_in_slices<F>(clients: &[Client], total: usize, query: F) -> Deferred<Vec<Row>>
where
    F: Fn(usize, usize) -> Command,
{
    if clients.is_empty() {
        return Deferred::settled(Err(Error::Config(
            "fan-out needs at least one client".to_string(),
        )));
    }

    let chunk = total.div_ceil(clients.len()).max(1);
    let mut slices = Vec::with_capacity(clients.len());
    for (index, client) in clients.iter().enumerate() {
        let offset = index * chunk;
        if offset >= total {
            break;
        }
        let limit = chunk.min(total - offset);
        debug!(slice = index, offset, limit, "Dispatching slice");
        slices.push(client.execute(query(offset, limit)).map(|result| result.rows));
    }

    Deferred::join_all(slices).map(|slices| slices.into_iter().flatten().collect())
}

//! 驱动连接、重置和查询完成的状态机。
//! The state machines that drive connects, resets and queries to completion.
//!
//! Each in-flight operation owns one watcher: a transient object bound to a
//! socket-readiness registration on the host event loop. A watcher reaches
//! exactly one terminal transition (completion, failure or timeout); the first
//! one to fire detaches the watch and cancels the timer, so the others become
//! unreachable.
//!
//! 每个进行中的操作拥有一个监视器：绑定到宿主事件循环上套接字就绪注册的临时对象。
//! 监视器只会经历一次终止转换（完成、失败或超时）；最先触发的一方会解除监视并取消定时器。

pub mod connect;
pub mod query;
pub mod reconnect;

//! Truvis 异步任务
//!
//! 在 rayon 线程池上多路复用的协作式状态机任务，以及运行中任务的登记表。
//!
//! - [`StatefulTask`](stateful_task::StatefulTask): 任务 trait，每次 `multiplex` 处理一个状态
//! - [`TaskEngine`](task_engine::TaskEngine): 调度器，负责 Continue / Yield / Wait / Finish
//! - [`RunningTasksTracker`](running_tasks::RunningTasksTracker): 拥有者用来确认异步工作已经全部结束

pub mod running_tasks;
pub mod stateful_task;
pub mod task_engine;

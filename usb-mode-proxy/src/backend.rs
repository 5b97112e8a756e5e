//! 传输层抽象
//!
//! proxy 只需要三件事：观察服务是否在总线上、创建接口句柄、
//! 在句柄上发起异步调用并订阅广播。真实实现见 [`crate::dbus`]。

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::error::{CallError, UsbModeError};
use crate::events::{DaemonCall, DaemonSignal, Presence};

/// 一个 usb_moded 接口句柄
///
/// 句柄被丢弃后，它上面未完成的调用结果不会再被应用。
pub trait RemoteInterface: Send + Sync {
    /// 发起一次方法调用，返回 daemon 的字符串结果
    fn call(&self, call: DaemonCall) -> BoxFuture<'static, Result<String, CallError>>;

    /// 订阅该句柄上的所有广播
    fn signals(&self) -> BoxFuture<'static, Result<BoxStream<'static, DaemonSignal>, UsbModeError>>;
}

/// 连接 usb_moded 的方式
pub trait Backend: Send + Sync + 'static {
    /// 服务出现/消失的事件流
    ///
    /// 第一个元素反映订阅时服务是否已经在总线上。
    fn presence(&self) -> BoxFuture<'static, Result<BoxStream<'static, Presence>, UsbModeError>>;

    /// 创建新的接口句柄
    fn open(&self) -> BoxFuture<'static, Result<Arc<dyn RemoteInterface>, UsbModeError>>;
}

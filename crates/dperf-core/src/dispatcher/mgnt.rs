//! 带外管理 TCP 连接。
//!
//! # 模块定位（Why）
//! - RoCE-UD 没有面向连接的握手，对端的 QPN/GID/LID 必须在启动期经由一条
//!   普通 TCP 连接交换；每个分发器至多一次，完成即关闭，不参与数据面；
//! - 读超时映射为 [`DperfError::HandshakeTimeout`]，对端关闭映射为
//!   [`DperfError::PeerLost`]，两者都发生在第一道屏障之前，按初始化
//!   失败处理。

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use socket2::SockRef;

use crate::error::{DperfError, Result};

/// 握手读写的实现定义时限。
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

fn configure_stream(stream: &TcpStream) -> Result<()> {
    let sock = SockRef::from(stream);
    sock.set_tcp_nodelay(true).map_err(map_io("设置 TCP_NODELAY"))?;
    // 握手报文极小，关闭阶段给内核一个短暂的冲刷窗口即可。
    sock.set_linger(Some(Duration::from_secs(1)))
        .map_err(map_io("设置 SO_LINGER"))?;
    stream
        .set_read_timeout(Some(HANDSHAKE_TIMEOUT))
        .map_err(map_io("设置读超时"))?;
    Ok(())
}

fn map_io(what: &'static str) -> impl Fn(std::io::Error) -> DperfError {
    move |e| DperfError::PeerLost {
        reason: format!("{what}失败: {e}"),
    }
}

/// 管理连接（已建立的双向流）。
pub struct MgntConn {
    reader: BufReader<TcpStream>,
}

impl MgntConn {
    fn new(stream: TcpStream) -> Result<Self> {
        configure_stream(&stream)?;
        Ok(Self {
            reader: BufReader::new(stream),
        })
    }

    /// 客户端：连接到对端管理端口。
    pub fn connect(remote_ip: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((remote_ip, port)).map_err(|e| DperfError::PeerLost {
            reason: format!("连接管理端口 {remote_ip}:{port} 失败: {e}"),
        })?;
        Self::new(stream)
    }

    /// 发送一行消息（自动补换行）。
    pub fn send_msg(&mut self, msg: &str) -> Result<()> {
        let stream = self.reader.get_mut();
        stream
            .write_all(msg.as_bytes())
            .and_then(|_| stream.write_all(b"\n"))
            .map_err(|e| DperfError::PeerLost {
                reason: format!("发送握手消息失败: {e}"),
            })
    }

    /// 接收一行消息。
    pub fn recv_msg(&mut self) -> Result<String> {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => Err(DperfError::PeerLost {
                reason: "握手连接被对端关闭".to_string(),
            }),
            Ok(_) => Ok(line.trim_end().to_string()),
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                Err(DperfError::HandshakeTimeout {
                    reason: format!("等待对端握手超过 {HANDSHAKE_TIMEOUT:?}"),
                })
            }
            Err(e) => Err(DperfError::PeerLost {
                reason: format!("接收握手消息失败: {e}"),
            }),
        }
    }
}

/// 管理连接监听端（服务端角色）。
pub struct MgntServer {
    listener: TcpListener,
}

impl MgntServer {
    /// 绑定监听端口（0 表示由内核分配，测试用）。
    pub fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).map_err(|e| DperfError::PeerLost {
            reason: format!("绑定管理端口 {port} 失败: {e}"),
        })?;
        Ok(Self { listener })
    }

    /// 实际监听端口。
    pub fn local_port(&self) -> u16 {
        self.listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(0)
    }

    /// 接受一条连接。
    pub fn accept(&self) -> Result<MgntConn> {
        let (stream, _) = self.listener.accept().map_err(|e| DperfError::PeerLost {
            reason: format!("接受管理连接失败: {e}"),
        })?;
        MgntConn::new(stream)
    }
}

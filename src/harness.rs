//! Remote test-harness handshake.
//!
//! A test process proves to the debugger that it was started on its behalf,
//! then asks for the kernel information of the test case to run:
//!
//! ```text
//! test process                       debugger
//!     | -- GREETING ----------------->  |
//!     | <-------------- CONFIRMATION -- |
//!     | -- KERNEL_INFO_REQUEST ------>  |
//!     | <------------- kernel info ---- |
//! ```
//!
//! Every string travels NUL-terminated.

use alloc::vec;
use alloc::vec::Vec;

use axerrno::{AxError, AxResult};

/// Largest message exchanged in either direction.
pub const MAX_MESSAGE_LEN: usize = 0x1000;

pub const GREETING: &str = "Hey there, Are you HyperDbg?";
pub const CONFIRMATION: &str = "Hello, Dear Test Process... Yes, I'm HyperDbg Debugger :)";
pub const KERNEL_INFO_REQUEST: &str =
    "Wow! I miss you... Would you plz send me the kernel information?";

/// A bidirectional message channel (named pipe, socket...).
pub trait MessageStream {
    fn send_message(&mut self, message: &[u8]) -> AxResult;

    /// Read one message into `buf` and return its length.
    fn read_message(&mut self, buf: &mut [u8]) -> AxResult<usize>;
}

/// Opaque kernel information selecting the test case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCaseKey(pub Vec<u8>);

#[derive(Debug)]
pub enum HandshakeError {
    Transport(AxError),
    /// The peer did not open with the greeting.
    UnexpectedGreeting,
    /// The debugger answered with something other than the confirmation.
    UnexpectedReply,
    /// The test process asked for something other than kernel information.
    UnexpectedRequest,
    /// The kernel information message was empty.
    EmptyReply,
}

impl core::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {:?}", e),
            Self::UnexpectedGreeting => write!(f, "peer did not greet"),
            Self::UnexpectedReply => write!(f, "peer is not the debugger"),
            Self::UnexpectedRequest => write!(f, "unexpected request from test process"),
            Self::EmptyReply => write!(f, "no kernel information received"),
        }
    }
}

impl core::error::Error for HandshakeError {}

impl From<AxError> for HandshakeError {
    fn from(e: AxError) -> Self {
        Self::Transport(e)
    }
}

fn send_str<S: MessageStream + ?Sized>(stream: &mut S, text: &str) -> AxResult {
    let mut message = Vec::with_capacity(text.len() + 1);
    message.extend_from_slice(text.as_bytes());
    message.push(0);
    stream.send_message(&message)
}

fn read<S: MessageStream + ?Sized>(stream: &mut S) -> AxResult<Vec<u8>> {
    let mut buf = vec![0u8; MAX_MESSAGE_LEN];
    let len = stream.read_message(&mut buf)?;
    if len > MAX_MESSAGE_LEN {
        return axerrno::ax_err!(InvalidData, "message longer than the buffer");
    }
    buf.truncate(len);
    Ok(buf)
}

/// Compare a received message against `expected`, ignoring the terminator.
fn is_message(received: &[u8], expected: &str) -> bool {
    let end = received.iter().position(|&b| b == 0).unwrap_or(received.len());
    &received[..end] == expected.as_bytes()
}

/// Test-process side: greet, check the confirmation, fetch the test case.
pub fn handshake<S: MessageStream + ?Sized>(stream: &mut S) -> Result<TestCaseKey, HandshakeError> {
    send_str(stream, GREETING)?;

    let reply = read(stream)?;
    if !is_message(&reply, CONFIRMATION) {
        log::warn!("harness: unexpected reply to greeting");
        return Err(HandshakeError::UnexpectedReply);
    }

    send_str(stream, KERNEL_INFO_REQUEST)?;
    let info = read(stream)?;
    if info.is_empty() {
        return Err(HandshakeError::EmptyReply);
    }

    log::info!("harness: received {} bytes of kernel information", info.len());
    Ok(TestCaseKey(info))
}

/// Debugger side: answer a test process and hand it `kernel_info`.
pub fn serve_handshake<S: MessageStream + ?Sized>(
    stream: &mut S,
    kernel_info: &[u8],
) -> Result<(), HandshakeError> {
    if kernel_info.len() > MAX_MESSAGE_LEN {
        return Err(axerrno::ax_err_type!(InvalidInput, "kernel information too large").into());
    }

    let greeting = read(stream)?;
    if !is_message(&greeting, GREETING) {
        return Err(HandshakeError::UnexpectedGreeting);
    }
    send_str(stream, CONFIRMATION)?;

    let request = read(stream)?;
    if !is_message(&request, KERNEL_INFO_REQUEST) {
        return Err(HandshakeError::UnexpectedRequest);
    }
    stream.send_message(kernel_info)?;

    log::debug!("harness: test process served");
    Ok(())
}

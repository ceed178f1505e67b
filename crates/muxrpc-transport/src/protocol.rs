//! Frame model, argument fragmentation and reassembly.
//!
//! A call carries three opaque arguments: `arg1` names the endpoint, `arg2` and
//! `arg3` are application headers and body. Arguments larger than
//! [`MAX_ARGS_PER_FRAME`] are split across a head frame and continuation frames; the
//! first chunk of every continuation extends the last argument of the frame before it.

use std::collections::{BTreeMap, HashMap};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, Result, TransportError};

/// Largest encoded frame accepted on the wire.
pub const MAX_FRAME_SIZE: usize = 1 << 20;

/// Argument bytes carried by a single call frame before fragmenting.
pub const MAX_ARGS_PER_FRAME: usize = 64 * 1024;

/// Largest total argument size accepted for one reassembled call or response.
pub const MAX_CALL_SIZE: usize = 64 << 20;

/// Address announced by a channel that does not listen.
pub const EPHEMERAL_HOST_PORT: &str = "0.0.0.0:0";

/// Per-connection operation id.
pub type OperationId = u32;

/// Transport headers attached to calls.
pub type Headers = BTreeMap<String, String>;

/// Which failures a call may be retried on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryFlags {
    /// Never retry.
    pub never: bool,
    /// Retry network, protocol and unexpected errors.
    pub on_connection_error: bool,
    /// Retry timeouts.
    pub on_timeout: bool,
}

impl Default for RetryFlags {
    fn default() -> Self {
        Self {
            never: false,
            on_connection_error: true,
            on_timeout: false,
        }
    }
}

impl RetryFlags {
    /// Flags that disable every retry.
    pub const NEVER: RetryFlags = RetryFlags {
        never: true,
        on_connection_error: false,
        on_timeout: false,
    };
}

/// The three arguments of a call or response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallArgs {
    /// Endpoint name.
    pub arg1: Bytes,
    /// Application headers.
    pub arg2: Bytes,
    /// Application body.
    pub arg3: Bytes,
}

impl CallArgs {
    /// Arguments from anything convertible to bytes.
    pub fn new(arg1: impl Into<Bytes>, arg2: impl Into<Bytes>, arg3: impl Into<Bytes>) -> Self {
        Self {
            arg1: arg1.into(),
            arg2: arg2.into(),
            arg3: arg3.into(),
        }
    }

    /// Total argument bytes.
    pub fn len(&self) -> usize {
        self.arg1.len() + self.arg2.len() + self.arg3.len()
    }

    /// Whether all three arguments are empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn into_parts(self) -> [Bytes; 3] {
        [self.arg1, self.arg2, self.arg3]
    }

    fn from_parts(parts: Vec<Bytes>) -> Result<Self> {
        if parts.len() > 3 {
            return Err(TransportError::Protocol {
                reason: format!("call carries {} arguments, expected at most 3", parts.len()),
            });
        }
        let mut parts = parts.into_iter();
        Ok(Self {
            arg1: parts.next().unwrap_or_default(),
            arg2: parts.next().unwrap_or_default(),
            arg3: parts.next().unwrap_or_default(),
        })
    }
}

/// Completed response delivered to the caller of an outbound operation.
#[derive(Debug, Clone)]
pub struct CallResponse {
    /// Operation id on the connection that carried it.
    pub id: OperationId,
    /// Whether the application reported success.
    pub ok: bool,
    /// Whether the payload is marked streamed.
    pub streamed: bool,
    /// Transport headers from the responder.
    pub headers: Headers,
    /// The three arguments.
    pub args: CallArgs,
    /// Identified name of the responding peer.
    pub remote_addr: String,
}

impl CallResponse {
    /// Response headers argument.
    pub fn arg2(&self) -> &Bytes {
        &self.args.arg2
    }

    /// Response body argument.
    pub fn arg3(&self) -> &Bytes {
        &self.args.arg3
    }
}

/// Fields of a call request that precede its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequestHead {
    /// Remaining time the caller is willing to wait.
    pub ttl_ms: u64,
    /// Service name.
    pub service: String,
    /// Transport headers.
    pub headers: Headers,
    /// Retry flags.
    pub retry_flags: RetryFlags,
    /// Whether the payload is marked streamed.
    pub streamed: bool,
}

/// Fields of a call response that precede its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResponseHead {
    /// Application-level success.
    pub ok: bool,
    /// Whether the payload is marked streamed.
    pub streamed: bool,
    /// Transport headers.
    pub headers: Headers,
}

/// Frame payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FrameBody {
    /// Opens the handshake.
    InitRequest {
        /// Address the sender listens on, or `0.0.0.0:0`.
        host_port: String,
        /// Announced process name.
        process_name: String,
    },
    /// Completes the handshake.
    InitResponse {
        /// Announced address.
        host_port: String,
        /// Announced process name.
        process_name: String,
    },
    /// First frame of a call.
    CallRequest {
        /// Fields before the arguments.
        head: CallRequestHead,
        /// Argument chunks.
        args: Vec<Bytes>,
        /// More frames follow.
        more: bool,
    },
    /// Continuation of a call.
    CallRequestCont {
        /// Argument chunks.
        args: Vec<Bytes>,
        /// More frames follow.
        more: bool,
    },
    /// First frame of a response.
    CallResponse {
        /// Fields before the arguments.
        head: CallResponseHead,
        /// Argument chunks.
        args: Vec<Bytes>,
        /// More frames follow.
        more: bool,
    },
    /// Continuation of a response.
    CallResponseCont {
        /// Argument chunks.
        args: Vec<Bytes>,
        /// More frames follow.
        more: bool,
    },
    /// Fails the operation.
    Error {
        /// Error class.
        code: ErrorCode,
        /// Human readable cause.
        message: String,
    },
    /// Liveness check.
    PingRequest,
    /// Answer to a ping.
    PingResponse,
}

/// Discriminant of a [`FrameBody`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Handshake request.
    InitRequest,
    /// Handshake response.
    InitResponse,
    /// Call head.
    CallRequest,
    /// Continuation of a call.
    CallRequestCont,
    /// Response head.
    CallResponse,
    /// Continuation of a response.
    CallResponseCont,
    /// Error frame.
    Error,
    /// Liveness check.
    PingRequest,
    /// Answer to a ping.
    PingResponse,
}

/// One unit on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Operation the frame belongs to; 0 for handshake frames.
    pub id: OperationId,
    /// Payload.
    pub body: FrameBody,
}

impl Frame {
    /// A frame for operation `id`.
    pub fn new(id: OperationId, body: FrameBody) -> Self {
        Self { id, body }
    }

    /// Discriminant of the body.
    pub fn kind(&self) -> FrameKind {
        match &self.body {
            FrameBody::InitRequest { .. } => FrameKind::InitRequest,
            FrameBody::InitResponse { .. } => FrameKind::InitResponse,
            FrameBody::CallRequest { .. } => FrameKind::CallRequest,
            FrameBody::CallRequestCont { .. } => FrameKind::CallRequestCont,
            FrameBody::CallResponse { .. } => FrameKind::CallResponse,
            FrameBody::CallResponseCont { .. } => FrameKind::CallResponseCont,
            FrameBody::Error { .. } => FrameKind::Error,
            FrameBody::PingRequest => FrameKind::PingRequest,
            FrameBody::PingResponse => FrameKind::PingResponse,
        }
    }

    /// Builds the head and continuation frames of a call request.
    pub fn call_request(id: OperationId, head: CallRequestHead, args: CallArgs) -> Vec<Frame> {
        let mut head = Some(head);
        fragment(args, MAX_ARGS_PER_FRAME)
            .into_iter()
            .map(|(args, more)| {
                let body = match head.take() {
                    Some(head) => FrameBody::CallRequest { head, args, more },
                    None => FrameBody::CallRequestCont { args, more },
                };
                Frame::new(id, body)
            })
            .collect()
    }

    /// Builds the head and continuation frames of a call response.
    pub fn call_response(id: OperationId, head: CallResponseHead, args: CallArgs) -> Vec<Frame> {
        let mut head = Some(head);
        fragment(args, MAX_ARGS_PER_FRAME)
            .into_iter()
            .map(|(args, more)| {
                let body = match head.take() {
                    Some(head) => FrameBody::CallResponse { head, args, more },
                    None => FrameBody::CallResponseCont { args, more },
                };
                Frame::new(id, body)
            })
            .collect()
    }

    /// An error frame for operation `id`.
    pub fn error(id: OperationId, code: ErrorCode, message: impl Into<String>) -> Frame {
        Frame::new(
            id,
            FrameBody::Error {
                code,
                message: message.into(),
            },
        )
    }
}

/// Splits call arguments into per-frame chunk lists of at most `max_per_frame` bytes.
///
/// Each entry is `(chunks, more)`; `more` is false only on the last frame.
pub fn fragment(args: CallArgs, max_per_frame: usize) -> Vec<(Vec<Bytes>, bool)> {
    let max_per_frame = max_per_frame.max(1);
    let mut frames = Vec::new();
    let mut current = Vec::with_capacity(3);
    let mut budget = max_per_frame;

    for mut rest in args.into_parts() {
        loop {
            if rest.len() <= budget {
                budget -= rest.len();
                current.push(rest);
                break;
            }
            current.push(rest.split_to(budget));
            frames.push(std::mem::take(&mut current));
            budget = max_per_frame;
        }
    }
    frames.push(current);

    let last = frames.len() - 1;
    frames
        .into_iter()
        .enumerate()
        .map(|(i, chunks)| (chunks, i != last))
        .collect()
}

struct Partial<H> {
    head: H,
    parts: Vec<BytesMut>,
    size: usize,
}

/// Collects fragmented calls per operation id until their last frame arrives.
pub struct Reassembly<H> {
    partial: HashMap<OperationId, Partial<H>>,
    max_size: usize,
}

impl<H> Default for Reassembly<H> {
    fn default() -> Self {
        Self::with_limit(MAX_CALL_SIZE)
    }
}

impl<H> Reassembly<H> {
    /// Reassembly capped at [`MAX_CALL_SIZE`] bytes per operation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reassembly capped at `max_size` argument bytes per operation.
    pub fn with_limit(max_size: usize) -> Self {
        Self {
            partial: HashMap::new(),
            max_size,
        }
    }

    fn too_large(&self, id: OperationId, size: usize) -> TransportError {
        TransportError::Protocol {
            reason: format!(
                "operation {} carries {} argument bytes, max {}",
                id, size, self.max_size
            ),
        }
    }

    /// Handles a head frame. Returns the complete call when `more` is false.
    pub fn start(
        &mut self,
        id: OperationId,
        head: H,
        args: Vec<Bytes>,
        more: bool,
    ) -> Result<Option<(H, CallArgs)>> {
        if self.partial.contains_key(&id) {
            return Err(TransportError::Protocol {
                reason: format!("head frame for operation {} already being assembled", id),
            });
        }
        if !more {
            return Ok(Some((head, CallArgs::from_parts(args)?)));
        }
        if args.len() > 3 {
            return Err(TransportError::Protocol {
                reason: format!("call carries {} arguments, expected at most 3", args.len()),
            });
        }
        let size = args.iter().map(Bytes::len).sum();
        if size > self.max_size {
            return Err(self.too_large(id, size));
        }
        let parts = args.iter().map(|chunk| BytesMut::from(&chunk[..])).collect();
        self.partial.insert(id, Partial { head, parts, size });
        Ok(None)
    }

    /// Handles a continuation frame.
    pub fn resume(
        &mut self,
        id: OperationId,
        args: Vec<Bytes>,
        more: bool,
    ) -> Result<Option<(H, CallArgs)>> {
        let max_size = self.max_size;
        let Some(partial) = self.partial.get_mut(&id) else {
            return Err(TransportError::Protocol {
                reason: format!("continuation for operation {} without a head frame", id),
            });
        };
        let size = partial.size + args.iter().map(Bytes::len).sum::<usize>();
        if size > max_size {
            self.partial.remove(&id);
            return Err(self.too_large(id, size));
        }
        partial.size = size;
        let mut chunks = args.into_iter();
        if let Some(first) = chunks.next() {
            match partial.parts.last_mut() {
                Some(last) => last.extend_from_slice(&first),
                None => partial.parts.push(BytesMut::from(&first[..])),
            }
        }
        for chunk in chunks {
            partial.parts.push(BytesMut::from(&chunk[..]));
        }
        if partial.parts.len() > 3 {
            self.partial.remove(&id);
            return Err(TransportError::Protocol {
                reason: format!("operation {} carries more than 3 arguments", id),
            });
        }
        if more {
            return Ok(None);
        }
        match self.partial.remove(&id) {
            Some(Partial { head, parts, .. }) => {
                let parts = parts.into_iter().map(BytesMut::freeze).collect();
                Ok(Some((head, CallArgs::from_parts(parts)?)))
            }
            None => Ok(None),
        }
    }

    /// Drops a partially assembled operation.
    pub fn discard(&mut self, id: OperationId) {
        self.partial.remove(&id);
    }

    /// Drops every partial operation.
    pub fn clear(&mut self) {
        self.partial.clear();
    }

    /// Operations still waiting for continuation frames.
    pub fn len(&self) -> usize {
        self.partial.len()
    }

    /// Whether no operation is partially assembled.
    pub fn is_empty(&self) -> bool {
        self.partial.is_empty()
    }
}

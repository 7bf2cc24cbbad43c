//! Protocol constants shared by the collector and test emulators.

use std::time::Duration;

/// Protocol version reported to legacy (single-command handshake) agents.
pub const PROTOCOL_VERSION: i64 = 1;

/// Protocol version reported by `GET_PROTOCOL_VERSION_V2`.
pub const PROTOCOL_VERSION_V2: i64 = 2;

// ── Command ids ──────────────────────────────────────────────────────

/// Deprecated: three identity strings, then the `INIT_STREAM_V2` body.
pub const COMMAND_INIT_STREAM: u8 = 1;
pub const COMMAND_INIT_STREAM_V2: u8 = 2;
pub const COMMAND_RCV_DATA: u8 = 3;
pub const COMMAND_CLOSE: u8 = 4;
/// Deprecated: replies with [`PROTOCOL_VERSION`], carries no identity.
pub const COMMAND_GET_PROTOCOL_VERSION: u8 = 5;
pub const COMMAND_GET_PROTOCOL_VERSION_V2: u8 = 6;
pub const COMMAND_REQUEST_ACK_FLUSH: u8 = 7;
/// Deprecated: command execution report, logged and ignored.
pub const COMMAND_REPORT_COMMAND_RESULT: u8 = 8;

/// Acknowledgment byte written after a successfully received data command.
pub const ACK_OK: u8 = 0x00;

/// Hard-failure byte: the agent must drop the connection and re-init.
pub const ACK_ERROR_MAGIC: u8 = 0xE7;

/// `REPORT_COMMAND_RESULT` success marker.
pub const COMMAND_SUCCESS: u8 = 1;

// ── Sizes ────────────────────────────────────────────────────────────

/// Upper bound on a single phrase inside a stream payload. The phrase
/// buffer holds at most this many unread bytes.
pub const MAX_PHRASE_SIZE: usize = 256 * 1024;

/// Upper bound on a single wire field (strings, RCV_DATA payloads).
pub const DATA_BUFFER_SIZE: usize = 64 * 1024;

// ── Timing ───────────────────────────────────────────────────────────

/// Deadline for completing any single field read from the socket.
pub const SOCKET_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle time after which a connection is considered dead; the supervisor
/// force-kills at twice this value.
pub const MAX_IDLE_BEFORE_DEATH: Duration = Duration::from_secs(30);

/// How often an idle connection re-checks whether buffered stream output
/// should be flushed.
pub const FLUSH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Maximum time buffered sink output may sit unflushed.
pub const MAX_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Sleep between readiness polls in the connection command loop.
pub const COMMAND_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Sleep while waiting for more socket bytes mid-field.
pub const READ_PARK_INTERVAL: Duration = Duration::from_micros(500);

/// Supervisor scan interval.
pub const SUPERVISOR_SCAN_INTERVAL: Duration = Duration::from_millis(10);

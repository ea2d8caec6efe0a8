//! Exit channel - fatal error reporting and scheduler teardown
//!
//! Any invariant violation, whether detected by the runtime or reported by
//! the policy through `scx_error!`, ends up in [`ExitState::record`]. Only
//! the first exit is kept. The runtime notices the pending exit at its next
//! host entry point and tears the scheduler down from there, never from
//! inside a callback.
//!
//! Policies report errors as a format string plus an array of 64-bit words
//! ([`format_bstr`]), the same wire contract the [`ExitSink`] collaborator
//! receives.

use alloc::string::String;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicI32, Ordering};
use spin::Mutex;

/// Maximum number of arguments to `error_bstr`
pub const ERROR_BSTR_MAX_ARGS: usize = 12;

/// Why the scheduler exited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitKind {
    None = 0,
    Done = 1,

    // ═══════════════════════════════════════════════════════════════
    // Unregistration
    // ═══════════════════════════════════════════════════════════════
    /// User space requested detach
    Unreg = 64,
    /// The policy requested detach
    UnregBpf = 65,
    /// The host requested detach
    UnregKern = 66,
    SysRq = 67,

    // ═══════════════════════════════════════════════════════════════
    // Errors
    // ═══════════════════════════════════════════════════════════════
    /// Invariant violation detected by the runtime
    Error = 1024,
    /// Error reported by the policy
    ErrorBpf = 1025,
    /// A runnable task was not scheduled in time
    ErrorStall = 1026,
}

impl ExitKind {
    pub fn from_raw(v: i32) -> Option<Self> {
        Some(match v {
            0 => Self::None,
            1 => Self::Done,
            64 => Self::Unreg,
            65 => Self::UnregBpf,
            66 => Self::UnregKern,
            67 => Self::SysRq,
            1024 => Self::Error,
            1025 => Self::ErrorBpf,
            1026 => Self::ErrorStall,
            _ => return None,
        })
    }

    pub fn is_error(&self) -> bool {
        *self as i32 >= Self::Error as i32
    }

    /// Human readable reason
    pub fn reason(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Done => "done",
            Self::Unreg => "unregistered from user space",
            Self::UnregBpf => "unregistered from BPF",
            Self::UnregKern => "unregistered from the main kernel",
            Self::SysRq => "disabled by sysrq-S",
            Self::Error => "runtime error",
            Self::ErrorBpf => "scx_bpf_error",
            Self::ErrorStall => "runnable task stall",
        }
    }
}

/// What the supervisor is told on exit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub kind: ExitKind,
    pub exit_code: i64,
    pub reason: &'static str,
    pub msg: String,
}

/// Receives the exit record once teardown is complete
pub trait ExitSink: Send + Sync {
    fn on_exit(&self, info: &ExitInfo);
}

/// First-exit-wins record
pub struct ExitState {
    kind: AtomicI32,
    info: Mutex<Option<ExitInfo>>,
    msg_len: usize,
}

impl ExitState {
    pub const fn new(msg_len: usize) -> Self {
        Self {
            kind: AtomicI32::new(ExitKind::None as i32),
            info: Mutex::new(None),
            msg_len,
        }
    }

    /// Record an exit. Returns false if an earlier exit already claimed the
    /// record, in which case this one is dropped.
    pub fn record(&self, kind: ExitKind, exit_code: i64, msg: &str) -> bool {
        if self
            .kind
            .compare_exchange(ExitKind::None as i32, kind as i32, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::trace!("sched_ext: dropping exit {:?}, already exiting", kind);
            return false;
        }

        let mut end = msg.len().min(self.msg_len);
        while !msg.is_char_boundary(end) {
            end -= 1;
        }
        let info = ExitInfo { kind, exit_code, reason: kind.reason(), msg: String::from(&msg[..end]) };

        if kind.is_error() {
            log::error!("sched_ext: {} ({})", info.reason, info.msg);
        } else {
            log::debug!("sched_ext: exit {:?} code {} ({})", kind, exit_code, info.msg);
        }
        *self.info.lock() = Some(info);
        true
    }

    /// An exit was recorded and teardown is due
    #[inline]
    pub fn pending(&self) -> bool {
        self.kind.load(Ordering::Acquire) != ExitKind::None as i32
    }

    pub fn info(&self) -> Option<ExitInfo> {
        self.info.lock().clone()
    }

    /// Forget the previous exit so the runtime can be enabled again
    pub fn reset(&self) {
        *self.info.lock() = None;
        self.kind.store(ExitKind::None as i32, Ordering::Release);
    }
}

/// Why a format string could not be rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BstrError {
    TooManyArgs(usize),
    MissingArg { index: usize },
    BadConversion(char),
    Truncated,
    /// Arguments left over once the format is consumed
    UnusedArgs { used: usize, given: usize },
}

impl fmt::Display for BstrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyArgs(n) => write!(f, "{} arguments, max {}", n, ERROR_BSTR_MAX_ARGS),
            Self::MissingArg { index } => write!(f, "missing argument {}", index),
            Self::BadConversion(c) => write!(f, "bad conversion '%{}'", c),
            Self::Truncated => write!(f, "format string ends inside a conversion"),
            Self::UnusedArgs { used, given } => write!(f, "{} of {} arguments used", used, given),
        }
    }
}

/// Integer width selected by the length modifier
#[derive(Clone, Copy)]
enum Width {
    Int,
    Long,
}

/// Append as much of `s` as fits under `limit` bytes. Once something is cut
/// the limit closes at the current length.
fn push_bounded(out: &mut String, s: &str, limit: &mut usize) {
    let room = limit.saturating_sub(out.len());
    if s.len() <= room {
        out.push_str(s);
        return;
    }
    let mut end = room;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    out.push_str(&s[..end]);
    *limit = out.len();
}

/// Render `fmt` against `data`, keeping at most `max_len` bytes of output.
///
/// Supports `%d %i %u %x %X %p %c %%`, an optional `0` flag, a field width
/// and the `l`/`ll` length modifiers. Without a length modifier integer
/// conversions use the low 32 bits of their word. Output past `max_len`,
/// padding included, is dropped but the format is still checked against
/// its arguments.
pub fn format_bstr(fmt: &str, data: &[u64], max_len: usize) -> core::result::Result<String, BstrError> {
    if data.len() > ERROR_BSTR_MAX_ARGS {
        return Err(BstrError::TooManyArgs(data.len()));
    }

    let mut out = String::with_capacity((fmt.len() + 8 * data.len()).min(max_len));
    let mut limit = max_len;
    let mut args = data.iter().copied();
    let mut used = 0usize;
    let mut chars = fmt.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            let mut buf = [0u8; 4];
            push_bounded(&mut out, c.encode_utf8(&mut buf), &mut limit);
            continue;
        }

        let mut zero_pad = false;
        let mut field = 0usize;
        if chars.peek() == Some(&'0') {
            zero_pad = true;
            chars.next();
        }
        while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
            field = field.saturating_mul(10).saturating_add(d as usize);
            chars.next();
        }
        let mut width = Width::Int;
        while chars.peek() == Some(&'l') {
            width = Width::Long;
            chars.next();
        }

        let conv = chars.next().ok_or(BstrError::Truncated)?;
        if conv == '%' {
            push_bounded(&mut out, "%", &mut limit);
            continue;
        }

        let raw = args.next().ok_or(BstrError::MissingArg { index: used })?;
        used += 1;

        let mut tmp = String::new();
        let res = match (conv, width) {
            ('d' | 'i', Width::Int) => write!(tmp, "{}", raw as u32 as i32),
            ('d' | 'i', Width::Long) => write!(tmp, "{}", raw as i64),
            ('u', Width::Int) => write!(tmp, "{}", raw as u32),
            ('u', Width::Long) => write!(tmp, "{}", raw),
            ('x', Width::Int) => write!(tmp, "{:x}", raw as u32),
            ('x', Width::Long) => write!(tmp, "{:x}", raw),
            ('X', Width::Int) => write!(tmp, "{:X}", raw as u32),
            ('X', Width::Long) => write!(tmp, "{:X}", raw),
            ('p', _) => write!(tmp, "0x{:x}", raw),
            ('c', _) => {
                tmp.push(char::from(raw as u8));
                Ok(())
            }
            (other, _) => return Err(BstrError::BadConversion(other)),
        };
        // Writing into a String cannot fail
        let _ = res;

        let pad = field.saturating_sub(tmp.chars().count());
        let fill = if zero_pad { '0' } else { ' ' };
        if zero_pad && tmp.starts_with('-') {
            push_bounded(&mut out, "-", &mut limit);
            tmp.remove(0);
        }
        let room = limit.saturating_sub(out.len());
        if pad > room {
            out.extend(core::iter::repeat(fill).take(room));
            limit = out.len();
        } else {
            out.extend(core::iter::repeat(fill).take(pad));
        }
        push_bounded(&mut out, &tmp, &mut limit);
    }

    if used != data.len() {
        return Err(BstrError::UnusedArgs { used, given: data.len() });
    }
    Ok(out)
}

/// Conversion of `scx_error!` arguments into 64-bit words
pub trait ScxArg {
    fn to_bstr_arg(self) -> u64;
}

macro_rules! impl_scx_arg_unsigned {
    ($($t:ty),*) => {
        $(impl ScxArg for $t {
            #[inline(always)]
            fn to_bstr_arg(self) -> u64 {
                self as u64
            }
        })*
    };
}

macro_rules! impl_scx_arg_signed {
    ($($t:ty),*) => {
        $(impl ScxArg for $t {
            #[inline(always)]
            fn to_bstr_arg(self) -> u64 {
                self as i64 as u64
            }
        })*
    };
}

impl_scx_arg_unsigned!(u8, u16, u32, u64, usize);
impl_scx_arg_signed!(i8, i16, i32, i64, isize);

impl ScxArg for bool {
    fn to_bstr_arg(self) -> u64 {
        self as u64
    }
}

impl ScxArg for char {
    fn to_bstr_arg(self) -> u64 {
        self as u64
    }
}

impl<T> ScxArg for *const T {
    fn to_bstr_arg(self) -> u64 {
        self as usize as u64
    }
}

/// Report a fatal policy error from a callback and trigger teardown.
///
/// ```ignore
/// scx_error!(ctx, "dsq %llu: bad vtime %llu", dsq_id, vtime);
/// ```
#[macro_export]
macro_rules! scx_error {
    ($ctx:expr, $fmt:expr $(, $arg:expr)* $(,)?) => {
        $ctx.error_bstr(
            $fmt,
            &[$($crate::scheduler::core::exit::ScxArg::to_bstr_arg($arg)),*],
        )
    };
}

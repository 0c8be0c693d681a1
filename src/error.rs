use crate::control::SiteId;
use crate::thread::ThreadId;
use thiserror::Error;

/// Stepping engine errors.
#[derive(Error, Debug)]
pub enum Error {
    // frame and unwind related errors
    #[error("frame {0} not found")]
    FrameNotFound(u32),
    #[error("no return address for current frame")]
    NoReturnAddress,
    #[error("backtrace for thread {0} is empty")]
    EmptyBacktrace(ThreadId),

    // breakpoint site related errors
    #[error("breakpoint site {0} not found")]
    SiteNotFound(SiteId),

    // errors from underlying process control
    #[error("process control: {0:#}")]
    Control(#[from] anyhow::Error),
}

impl Error {
    /// Some errors mean that it is impossible to continue session, this method used
    /// to determine these errors.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::EmptyBacktrace(_))
    }
}

#[macro_export]
macro_rules! _error {
    ($log_macro: ident, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                log::$log_macro!(target: "stepper", "{msg}: {err:#}", msg = $msg, err = e);
                None
            }
        }
    };
}

/// Transforms `Result<T, E>` to `Option<T>` with error logging (error level).
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(error, $res, "unexpected error")
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(error, $res, $msg)
    };
}

/// Transforms `Result<T, E>` to `Option<T>` with error logging (debug level).
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(debug, $res, "ignored error")
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(debug, $res, $msg)
    };
}

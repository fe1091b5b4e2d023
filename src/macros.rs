#![allow(unused_macros)]

macro_rules! trace {
    ($($t:tt)*) => {
        log!(trace, $($t)*)
    }
}

macro_rules! debug {
    ($($t:tt)*) => {
        log!(debug, $($t)*)
    }
}

macro_rules! info {
    ($($t:tt)*) => {
        log!(info, $($t)*)
    }
}

macro_rules! warn {
    ($($t:tt)*) => {
        log!(warn, $($t)*)
    }
}

macro_rules! error {
    ($($t:tt)*) => {
        log!(error, $($t)*)
    }
}

// One block, so call sites may use it as a statement or a match arm. The
// disabled branch type-checks the arguments through `format!` without
// evaluating them.
macro_rules! log {
    ($level: ident, $($t:tt)*) => {{
        #[cfg(feature = "tracing")]
        tracing::$level!(target: "rseme", $($t)*);
        #[cfg(not(feature = "tracing"))]
        let _ = || format!($($t)*);
    }}
}

#[cfg(test)]
mod tests {
    #[test]
    fn macros_work_in_expression_position() {
        let value: Option<u32> = None;
        match value {
            Some(v) => debug!("got {}", v),
            None => trace!("nothing"),
        }
        let logged = Some(3).map(|v| info!("value {}", v));
        assert!(logged.is_some());
    }
}

use std::fmt;
use std::ops::BitOr;

const MODULE: u8 = 1 << 0;
const STRICT: u8 = 1 << 1;
const STRIP: u8 = 1 << 2;

/// How a source string is evaluated.
///
/// A kind (`GLOBAL` or `MODULE`) combined with optional flags:
///
/// ```
/// use jsactor::EvalMode;
///
/// let mode = EvalMode::GLOBAL | EvalMode::STRICT | EvalMode::STRIP;
/// assert!(mode.is_strict() && mode.is_strip() && !mode.is_module());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EvalMode(u8);

impl EvalMode {
    /// Script evaluated against the global object. The result is the value
    /// of the last expression.
    pub const GLOBAL: EvalMode = EvalMode(0);
    /// ES module. Always strict; the result is the module's completion value.
    pub const MODULE: EvalMode = EvalMode(MODULE);
    pub const STRICT: EvalMode = EvalMode(STRICT);
    /// Remove file, line and stack details from returned errors.
    pub const STRIP: EvalMode = EvalMode(STRIP);

    pub fn is_module(self) -> bool {
        self.0 & MODULE != 0
    }

    pub fn is_strict(self) -> bool {
        self.is_module() || self.0 & STRICT != 0
    }

    pub fn is_strip(self) -> bool {
        self.0 & STRIP != 0
    }

    pub fn strict(self) -> Self {
        self | Self::STRICT
    }

    pub fn strip(self) -> Self {
        self | Self::STRIP
    }
}

impl BitOr for EvalMode {
    type Output = EvalMode;

    fn bitor(self, rhs: Self) -> Self::Output {
        EvalMode(self.0 | rhs.0)
    }
}

impl fmt::Debug for EvalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.is_module() { "MODULE" } else { "GLOBAL" })?;
        if self.0 & STRICT != 0 {
            f.write_str(" | STRICT")?;
        }
        if self.is_strip() {
            f.write_str(" | STRIP")?;
        }
        Ok(())
    }
}

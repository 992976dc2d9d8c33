use std::fmt;

/// Identifies the source position of an intercepted operation.
///
/// Instrumented code captures one with [`code_location!`]; the engine treats
/// it as an opaque token, only the spin-loop detector and failure reports
/// look inside.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeLocation {
    file: &'static str,
    class_name: &'static str,
    method: &'static str,
    line: u32,
}

impl CodeLocation {
    pub fn new(
        file: &'static str,
        class_name: &'static str,
        method: &'static str,
        line: u32,
    ) -> CodeLocation {
        CodeLocation {
            file,
            class_name,
            method,
            line,
        }
    }

    pub fn is_captured(&self) -> bool {
        !self.file.is_empty()
    }
}

impl fmt::Display for CodeLocation {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.class_name.is_empty() {
            write!(fmt, "{}:{}", self.file, self.line)
        } else {
            write!(
                fmt,
                "{}.{} ({}:{})",
                self.class_name, self.method, self.file, self.line
            )
        }
    }
}

/// Capture the current source position as a [`CodeLocation`].
///
/// The two-argument form also records the class and method names the way an
/// instrumentation pass would.
#[macro_export]
macro_rules! code_location {
    () => {
        $crate::rt::location::CodeLocation::new(file!(), "", "", line!())
    };
    ($class:expr, $method:expr) => {
        $crate::rt::location::CodeLocation::new(file!(), $class, $method, line!())
    };
}

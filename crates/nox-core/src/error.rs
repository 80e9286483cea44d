/// A single compile-time diagnostic. The message is already formatted in the
/// `[line N] Error at 'x': ...` shape when it comes out of the compiler.
#[derive(Debug, Clone, PartialEq)]
pub struct NoxCompilerError {
    pub message: String,
    pub line: u32,
}

impl NoxCompilerError {
    pub fn new(message: String, line: u32) -> Self {
        Self { message, line }
    }
}

impl std::fmt::Display for NoxCompilerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for NoxCompilerError {}

/// Everything one compile produced. The compiler synchronizes and keeps
/// parsing after an error, so this usually carries more than one diagnostic.
#[derive(Debug, Clone, PartialEq)]
pub struct NoxPipelineError(Vec<NoxCompilerError>);

impl NoxPipelineError {
    pub fn new(errors: Vec<NoxCompilerError>) -> Self {
        Self(errors)
    }

    pub fn all(&self) -> &[NoxCompilerError] {
        &self.0
    }

    pub fn into_errors(self) -> Vec<NoxCompilerError> {
        self.0
    }
}

impl std::fmt::Display for NoxPipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for NoxPipelineError {}

#[derive(Debug, Clone)]
pub struct NativeFunctionError(pub String);

impl NativeFunctionError {
    pub fn new(message: &str) -> Self {
        Self(message.to_string())
    }

    pub fn into_runtime_error(self, line: u32) -> NoxRuntimeError {
        NoxRuntimeError::new(self.0, line)
    }
}

impl From<&'static str> for NativeFunctionError {
    fn from(value: &'static str) -> Self {
        NativeFunctionError::new(value)
    }
}

/// One stack trace frame: `[line N] in f()`, or `[line N] in script` for the
/// top-level frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    callee: String,
    line: u32,
}

impl Trace {
    pub fn new(callee: &str, line: u32) -> Self {
        Self {
            callee: callee.to_string(),
            line,
        }
    }
}

impl std::fmt::Display for Trace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[line {}] in {}", self.line, self.callee)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NoxRuntimeError {
    pub message: String,
    pub line: u32,
    pub stack_trace: Vec<Trace>,
}

impl NoxRuntimeError {
    pub fn new(message: String, line: u32) -> Self {
        Self {
            message,
            line,
            stack_trace: Vec::new(),
        }
    }

    pub fn with_stack_trace(mut self, stack_trace: Vec<Trace>) -> Self {
        self.stack_trace = stack_trace;
        self
    }
}

impl std::fmt::Display for NoxRuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        for trace in &self.stack_trace {
            writeln!(f)?;
            write!(f, "{}", trace)?;
        }
        Ok(())
    }
}

impl std::error::Error for NoxRuntimeError {}

/// Collects compile diagnostics so the parser can synchronize and continue
/// instead of bailing at the first error.
#[derive(Debug, Clone, Default)]
pub struct ErrorReporter {
    errors: Vec<NoxCompilerError>,
}

impl ErrorReporter {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    pub fn report_error(&mut self, error: NoxCompilerError) {
        self.errors.push(error);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[NoxCompilerError] {
        &self.errors
    }

    pub fn take_errors(&mut self) -> Vec<NoxCompilerError> {
        std::mem::take(&mut self.errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_error_display_includes_trace() {
        let error = NoxRuntimeError::new("Undefined variable 'a'.".to_string(), 3)
            .with_stack_trace(vec![Trace::new("f()", 3), Trace::new("script", 7)]);

        let rendered = error.to_string();
        assert_eq!(
            rendered,
            "Undefined variable 'a'.\n[line 3] in f()\n[line 7] in script"
        );
    }

    #[test]
    fn test_reporter_collects_multiple_errors() {
        let mut reporter = ErrorReporter::new();
        reporter.report_error(NoxCompilerError::new("first".to_string(), 1));
        reporter.report_error(NoxCompilerError::new("second".to_string(), 2));

        assert!(reporter.has_errors());
        assert_eq!(reporter.errors().len(), 2);

        let errors = reporter.take_errors();
        assert_eq!(errors[1].line, 2);
        assert!(!reporter.has_errors());
    }
}

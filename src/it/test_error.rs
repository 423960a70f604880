use {
    crate::utils::errorfmt::ErrorFmt,
    std::{
        error::Error,
        fmt::{Debug, Display, Formatter},
    },
};

pub type TestResult<T = ()> = Result<T, TestError>;

pub struct TestError {
    error: Box<dyn Error + Send + 'static>,
    source: Option<Box<TestError>>,
}

impl TestError {
    pub fn new<D: Display + Send + 'static>(d: D) -> Self {
        Self {
            error: Box::new(DisplayError { msg: d }),
            source: None,
        }
    }
}

struct DisplayError<T: Display> {
    msg: T,
}

impl<T: Display> Debug for DisplayError<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.msg, f)
    }
}

impl<T: Display> Display for DisplayError<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.msg, f)
    }
}

impl<T: Display> Error for DisplayError<T> {}

impl Debug for TestError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl Display for TestError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)?;
        match &self.source {
            Some(source) => write!(f, ": {}", source),
            None => match self.error.source() {
                Some(e) => write!(f, ": {}", ErrorFmt(e)),
                None => Ok(()),
            },
        }
    }
}

impl<T: Error + Send + 'static> From<T> for TestError {
    fn from(error: T) -> Self {
        Self {
            error: Box::new(error),
            source: None,
        }
    }
}

pub trait TestErrorExt {
    type Context;

    fn with_context<D, F>(self, f: F) -> Self::Context
    where
        D: Display + Send + 'static,
        F: FnOnce() -> D;
}

impl<T, E> TestErrorExt for Result<T, E>
where
    E: Into<TestError>,
{
    type Context = TestResult<T>;

    fn with_context<D, F>(self, f: F) -> Self::Context
    where
        D: Display + Send + 'static,
        F: FnOnce() -> D,
    {
        self.map_err(|e| TestError {
            error: Box::new(DisplayError { msg: f() }),
            source: Some(Box::new(e.into())),
        })
    }
}

impl<T> TestErrorExt for Option<T> {
    type Context = TestResult<T>;

    fn with_context<D, F>(self, f: F) -> Self::Context
    where
        D: Display + Send + 'static,
        F: FnOnce() -> D,
    {
        self.ok_or_else(|| TestError::new(f()))
    }
}

macro_rules! bail {
    ($($tt:tt)*) => {{
        let msg = format!($($tt)*);
        return Err(crate::it::test_error::TestError::new(msg));
    }}
}

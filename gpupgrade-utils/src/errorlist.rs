// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use std::{error, fmt};

pub type BoxedError = Box<dyn error::Error + Send + Sync + 'static>;

/// An error that aggregates the independent failures of a fan-out.
///
/// Every failure is surfaced, not just the first. Appending another
/// `ErrorList` flattens it so nested fan-outs read as one flat report.
#[derive(Debug, Default)]
pub struct ErrorList {
    errors: Vec<BoxedError>,
}

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: impl Into<BoxedError>) {
        let err = err.into();

        match err.downcast::<ErrorList>() {
            Ok(xs) => self.errors.extend(xs.errors),
            Err(err) => self.errors.push(err),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[BoxedError] {
        &self.errors
    }

    /// `Ok(())` when nothing was collected, the list otherwise.
    pub fn into_result(self) -> Result<(), ErrorList> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }

            write!(f, "{}", e)?;
        }

        Ok(())
    }
}

impl error::Error for ErrorList {}

impl<E: Into<BoxedError>> Extend<E> for ErrorList {
    fn extend<T: IntoIterator<Item = E>>(&mut self, iter: T) {
        for e in iter {
            self.push(e);
        }
    }
}

impl<E: Into<BoxedError>> std::iter::FromIterator<E> for ErrorList {
    fn from_iter<T: IntoIterator<Item = E>>(iter: T) -> Self {
        let mut xs = Self::new();
        xs.extend(iter);

        xs
    }
}

/// Collects the `Err` halves of a fan-out's results into a single error.
pub fn collect_errors<T, E: Into<BoxedError>>(
    results: impl IntoIterator<Item = Result<T, E>>,
) -> Result<Vec<T>, ErrorList> {
    let mut oks = vec![];
    let mut errs = ErrorList::new();

    for r in results {
        match r {
            Ok(x) => oks.push(x),
            Err(e) => errs.push(e),
        }
    }

    errs.into_result().map(|_| oks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn io_err(msg: &str) -> io::Error {
        io::Error::new(io::ErrorKind::Other, msg.to_string())
    }

    #[test]
    fn test_empty_list_is_ok() {
        assert!(ErrorList::new().into_result().is_ok());
    }

    #[test]
    fn test_every_failure_is_surfaced() {
        let mut xs = ErrorList::new();
        xs.push(io_err("sdw1: connection refused"));
        xs.push(io_err("sdw3: no space left on device"));

        let err = xs.into_result().unwrap_err();

        assert_eq!(err.len(), 2);
        assert_eq!(
            err.to_string(),
            "sdw1: connection refused\nsdw3: no space left on device"
        );
    }

    #[test]
    fn test_nested_lists_are_flattened() {
        let mut inner = ErrorList::new();
        inner.push(io_err("a"));
        inner.push(io_err("b"));

        let mut outer = ErrorList::new();
        outer.push(io_err("c"));
        outer.push(inner);

        assert_eq!(outer.len(), 3);
    }

    #[test]
    fn test_collect_errors_partitions_results() {
        let results: Vec<Result<i32, io::Error>> =
            vec![Ok(1), Err(io_err("boom")), Ok(2), Err(io_err("bang"))];

        let err = collect_errors(results).unwrap_err();

        assert_eq!(err.len(), 2);
    }
}

//! Parameter list macro.

/// Build a `Vec<QueryParam>` from heterogeneous values.
///
/// Each value goes through `QueryParam::from`, so integers, strings,
/// booleans, floats, byte vectors and `Option`s of those all work.
///
/// # Example
///
/// ```
/// use dbkit::models::QueryParam;
///
/// let params = dbkit::params!["xiaoming", 40, None::<i64>];
/// assert_eq!(params[1], QueryParam::Int(40));
/// assert!(params[2].is_null());
/// ```
#[macro_export]
macro_rules! params {
    () => {
        ::std::vec::Vec::<$crate::models::QueryParam>::new()
    };
    ($($value:expr),+ $(,)?) => {
        ::std::vec![$($crate::models::QueryParam::from($value)),+]
    };
}

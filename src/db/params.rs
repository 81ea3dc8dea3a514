//! Parameter binding for `Any` queries.
//!
//! Values are attached positionally, in the order the caller supplied them.

use crate::models::QueryParam;
use sqlx::Any;
use sqlx::any::AnyArguments;
use sqlx::query::Query;

pub(crate) type AnyQuery<'q> = Query<'q, Any, AnyArguments<'q>>;

/// Bind a single parameter.
pub(crate) fn bind_param<'q>(query: AnyQuery<'q>, param: &'q QueryParam) -> AnyQuery<'q> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
    }
}

/// Bind every parameter in order.
pub(crate) fn bind_params<'q>(query: AnyQuery<'q>, params: &'q [QueryParam]) -> AnyQuery<'q> {
    params.iter().fold(query, bind_param)
}

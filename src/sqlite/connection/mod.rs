mod core;
mod dml;
mod maintenance;
mod select;
mod shared;
mod tx;

pub(crate) use core::RetryContext;
pub use core::{Connection, ConnectionStatus, StatusHandle};
pub use maintenance::ForeignKeyViolation;
pub use shared::SharedConnection;
pub(crate) use shared::run_with_token;
pub use tx::TxBehavior;
pub(crate) use tx::end_transaction_with_busy_retries;

use crate::error::StorageError;
use crate::types::SqlValue;

/// Bind every positional argument, refusing a count that differs from the placeholders.
pub(crate) fn bind_args(
    stmt: &mut rusqlite::Statement<'_>,
    args: &[SqlValue],
) -> Result<(), StorageError> {
    let expected = stmt.parameter_count();
    if expected != args.len() {
        return Err(rusqlite::Error::InvalidParameterCount(args.len(), expected).into());
    }
    for (idx, arg) in args.iter().enumerate() {
        stmt.raw_bind_parameter(idx + 1, arg)?;
    }
    Ok(())
}

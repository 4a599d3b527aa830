//! Per-transaction metadata and statement-type policing

use crate::location::DatabaseRef;
use std::fmt;
use std::time::Duration;

/// Immutable metadata the client session supplied when the transaction began.
#[derive(Debug, Clone)]
pub struct TransactionInfo {
    /// The database the client session is connected to.
    pub session_database: DatabaseRef,
    /// Address of the connected client, for supervision listings.
    pub client_address: String,
    /// Executing user. `None` when the client is anonymous or auth is
    /// disabled; supervision output omits the user in that case.
    pub authenticated_user: Option<String>,
    /// Client-supplied override of the process-default transaction timeout.
    pub timeout: Option<Duration>,
}

impl TransactionInfo {
    pub fn new(
        session_database: DatabaseRef,
        client_address: impl Into<String>,
        authenticated_user: Option<String>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            session_database,
            client_address: client_address.into(),
            authenticated_user,
            timeout,
        }
    }
}

/// Classification of one submitted statement.
///
/// A transaction records the most permissive type seen so far and rejects
/// mixes that the underlying engines cannot honor in a single transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementType {
    ReadQuery,
    WriteQuery,
    SchemaCommand,
}

impl StatementType {
    pub fn is_query(self) -> bool {
        matches!(self, StatementType::ReadQuery | StatementType::WriteQuery)
    }

    pub fn is_schema_command(self) -> bool {
        matches!(self, StatementType::SchemaCommand)
    }

    /// The type the transaction records after a statement of type `next`
    /// executes, or `None` when the combination is forbidden.
    ///
    /// Read and write queries mix freely (the record upgrades to write);
    /// read queries and schema commands mix (the record upgrades to schema);
    /// write queries and schema commands never mix, in either order.
    pub(crate) fn merge(self, next: StatementType) -> Option<StatementType> {
        use StatementType::*;

        if self == next {
            return Some(self);
        }
        match (self, next) {
            (ReadQuery, WriteQuery) | (WriteQuery, ReadQuery) => Some(WriteQuery),
            (ReadQuery, SchemaCommand) | (SchemaCommand, ReadQuery) => Some(SchemaCommand),
            (WriteQuery, SchemaCommand) | (SchemaCommand, WriteQuery) => None,
            _ => unreachable!("equal types handled above"),
        }
    }
}

impl fmt::Display for StatementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatementType::ReadQuery => "a read query",
            StatementType::WriteQuery => "a write query",
            StatementType::SchemaCommand => "a schema command",
        };
        write!(f, "{}", name)
    }
}

use deadpool::managed::{HookError, HookResult};
use diesel::{r2d2::CustomizeConnection, Connection};
use diesel_async::{pooled_connection::PoolError, AsyncConnection};

/// Wraps every pooled connection in a transaction that's never committed, so
/// a test run's writes never escape to the next test. Generic over the
/// backend connection type so both the sync sqlite pool and (indirectly,
/// via [test_transaction_hook]) the async mysql pool can share the idiom.
#[derive(Debug)]
pub struct TestTransactionCustomizer;

impl<C> CustomizeConnection<C, diesel::r2d2::Error> for TestTransactionCustomizer
where
    C: Connection + 'static,
{
    fn on_acquire(&self, conn: &mut C) -> Result<(), diesel::r2d2::Error> {
        conn.begin_test_transaction()
            .map_err(diesel::r2d2::Error::QueryError)
    }
}

pub async fn test_transaction_hook<T>(conn: &mut T) -> HookResult<PoolError>
where
    T: AsyncConnection,
{
    conn.begin_test_transaction()
        .await
        .map_err(|e| HookError::Backend(PoolError::QueryError(e)))
}

use sqlx::PgPool;

/// PostgreSQL error codes that signal "already exists" during idempotent
/// DDL replay.
const DUPLICATE_CODES: [&str; 3] = [
    "42P06", // duplicate_schema
    "42P07", // duplicate_table
    "42710", // duplicate_object
];

/// Execute statements in order. Statements failing with a duplicate
/// error are logged and skipped; everything else aborts the run.
pub async fn apply_statements(pool: &PgPool, statements: &[String]) -> Result<(), sqlx::Error> {
    for statement in statements {
        match sqlx::query(statement).execute(pool).await {
            Ok(_) => {}
            Err(sqlx::Error::Database(db_err))
                if db_err
                    .code()
                    .map_or(false, |code| DUPLICATE_CODES.contains(&code.as_ref())) =>
            {
                tracing::info!(statement = %first_line(statement), "object already exists, skipping");
            }
            Err(err) => {
                tracing::error!(statement = %first_line(statement), error = %err, "statement failed");
                return Err(err);
            }
        }
    }
    Ok(())
}

fn first_line(statement: &str) -> &str {
    statement.lines().next().unwrap_or(statement)
}

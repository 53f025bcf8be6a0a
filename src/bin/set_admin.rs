use std::io::{self, Write};

use clap::Parser;
use sqlx::postgres::PgPoolOptions;

use codekata_api::auth::{AuthError, IdentityStore, PgIdentityStore};

#[derive(Parser, Debug)]
#[command(name = "set_admin", about = "Grant or revoke admin rights for a user")]
struct Args {
    /// Internal id of the user to update.
    #[arg(long)]
    user_id: i64,

    /// Revoke admin rights instead of granting them.
    #[arg(long)]
    revoke: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let args = Args::parse();

    let database_url = std::env::var("DATABASE_URL")?;
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&database_url)
        .await?;

    let store = PgIdentityStore::new(pool);
    let is_admin = !args.revoke;
    match store.set_admin(args.user_id, is_admin).await {
        Ok(user) => {
            println!(
                "user {} ({}) is_admin={}; takes effect at the next login or refresh",
                user.id, user.name, user.is_admin
            );
            Ok(())
        }
        Err(AuthError::UserNotFound(user_id)) => {
            writeln!(io::stderr(), "error: user {user_id} does not exist")?;
            std::process::exit(1);
        }
        Err(err) => Err(err.into()),
    }
}

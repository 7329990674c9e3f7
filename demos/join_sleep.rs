use lockstep::{Task, join_all, sleep_for};
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn sleeper(id: i32, duration: Duration) -> Task<i32> {
    Task::new(async move {
        println!("Sleep {id}");
        sleep_for(duration).await;
        println!("Sleep {id} wake up");
        Ok(id)
    })
}

fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("warn"))
        .expect("warn filter is valid");
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(env_filter)
        .init();

    let main = Task::new(async {
        let (a, b) = join_all((
            sleeper(1, Duration::from_secs(1)),
            sleeper(2, Duration::from_secs(1)),
        ))
        .await?;
        println!("{a} {b}");

        let (c, d) = join_all((
            sleeper(1, Duration::from_secs(1)),
            sleeper(2, Duration::from_secs(1)),
        ))
        .await?;
        println!("{c} {d}");
        Ok(())
    });

    lockstep::block_on(main)
}

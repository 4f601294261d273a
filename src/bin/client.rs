use anyhow::Result;
use rand::Rng;
use tokio::io::{AsyncBufReadExt, BufReader, Stdin};

use replikv::{config::Config, service::DatastoreClient};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env()?;
    let index = rand::thread_rng().gen_range(0..config.num_replicas);
    let addr = config.client_addr(index);
    println!("connecting to replica {index} at {addr}");
    let mut client = DatastoreClient::connect(&addr).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    loop {
        println!();
        println!("choose an operation:");
        println!("  1. GET");
        println!("  2. PUT");
        println!("  3. DELETE");
        println!("  q. quit");
        let Some(choice) = prompt(&mut stdin, "enter a choice: ").await? else {
            break;
        };

        match choice.as_str() {
            "1" => {
                let Some(key) = prompt(&mut stdin, "key: ").await? else {
                    break;
                };
                let value = client.get(&key).await?;
                println!("result: {value}");
            }
            "2" => {
                let Some(key) = prompt(&mut stdin, "key: ").await? else {
                    break;
                };
                let Some(value) = prompt(&mut stdin, "value: ").await? else {
                    break;
                };
                client.put(&key, &value).await?;
                println!("stored {key}");
            }
            "3" => {
                let Some(key) = prompt(&mut stdin, "key: ").await? else {
                    break;
                };
                client.delete(&key).await?;
                println!("deleted {key}");
            }
            "q" | "quit" => break,
            other => println!("invalid choice {other:?}, try 1, 2, 3 or q"),
        }
    }

    Ok(())
}

/// Prints a prompt and reads one trimmed line. `None` on end of input.
async fn prompt(stdin: &mut BufReader<Stdin>, label: &str) -> Result<Option<String>> {
    use std::io::Write;

    print!("{label}");
    std::io::stdout().flush()?;

    let mut line = String::new();
    let bytes = stdin.read_line(&mut line).await?;
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

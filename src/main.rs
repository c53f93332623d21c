#[tokio::main]
async fn main() {
    if let Err(e) = fleetwatch_lib::run().await {
        eprintln!("fleetwatch: {}", e);
        std::process::exit(1);
    }
}

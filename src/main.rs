#[tokio::main]
async fn main() {
    let code = t2s::run_from_env().await;
    std::process::exit(code);
}

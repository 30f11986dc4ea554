//! planrun - 命令行入口
//!
//! 初始化日志、解析命令并以运行结果对应的退出码结束进程。

mod cli;

use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();
    planrun::observability::init(cli.log_level());
    let code = cli.run().await;
    std::process::exit(code);
}

use clap::Parser;

/// Anthropic 兼容的 AWS Bedrock 网关
#[derive(Parser, Debug)]
#[command(name = "bedrock-rs", version, about)]
pub struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    pub config: Option<String>,
}

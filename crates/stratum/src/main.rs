mod commands;
mod emulator;
mod manifest;
mod resources;
mod stack;
mod utils;
mod watcher;

use clap::{Args, Parser, Subcommand};
use commands::Invocation;
use stack::Stack;
use stratum_config::Profile;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stratum")]
#[command(about = "宣言したとおりに、何度でも。", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 進捗表示を抑え、ログを warn 以上にする
    #[arg(short, long, global = true)]
    quiet: bool,

    /// 認証情報のプロファイル
    #[arg(long, env = "STRATUM_PROFILE", global = true)]
    profile: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// リソースを作成・更新し、宣言から消えたものを削除
    Deploy(PassArgs),
    /// ステージのリソースをすべて削除
    Destroy(PassArgs),
    /// ローカルモードで起動し、変更を監視して再実行
    Dev(PassArgs),
    /// 記録済みの出力を表示（変更はしない）
    Run(PassArgs),
    /// バージョン情報を表示
    Version,
}

#[derive(Args)]
struct PassArgs {
    /// ステージ名 (省略時は $USER または dev)
    stage: Option<String>,
    /// ステージ名 (-s/--stage フラグ、STRATUM_STAGE 環境変数)
    #[arg(
        short = 's',
        long = "stage",
        env = "STRATUM_STAGE",
        conflicts_with = "stage"
    )]
    stage_flag: Option<String>,
    /// 変更がなくても更新を実行
    #[arg(long)]
    force: bool,
    /// 既存のオブジェクトを管理下に取り込む
    #[arg(long)]
    adopt: bool,
}

impl PassArgs {
    fn invocation(self, quiet: bool, profile: Option<&str>) -> anyhow::Result<Invocation> {
        Ok(Invocation {
            stage: utils::determine_stage_name(self.stage.or(self.stage_flag)),
            profile: Profile::resolve(profile)?,
            force: self.force,
            adopt: self.adopt,
            quiet,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ログは stderr に出力 (RUST_LOG を優先、--quiet なら warn)
    let filter = if cli.quiet {
        EnvFilter::new("warn")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Versionコマンドは設定ファイル不要
    if matches!(cli.command, Commands::Version) {
        println!("stratum {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let stack = Stack::discover()?;

    // コマンドディスパッチ
    match cli.command {
        Commands::Deploy(args) => {
            let invocation = args.invocation(cli.quiet, cli.profile.as_deref())?;
            commands::deploy::handle(&stack, &invocation).await?;
        }
        Commands::Destroy(args) => {
            let invocation = args.invocation(cli.quiet, cli.profile.as_deref())?;
            commands::destroy::handle(&stack, &invocation).await?;
        }
        Commands::Dev(args) => {
            let invocation = args.invocation(cli.quiet, cli.profile.as_deref())?;
            commands::dev::handle(stack, &invocation).await?;
        }
        Commands::Run(args) => {
            let invocation = args.invocation(cli.quiet, cli.profile.as_deref())?;
            commands::run::handle(&stack, &invocation).await?;
        }
        Commands::Version => {
            unreachable!("Version is handled before stack loading");
        }
    }

    Ok(())
}

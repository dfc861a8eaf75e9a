use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Arg, ArgMatches, Command};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use cronflow_config::AppConfig;
use cronflow_infrastructure::MIGRATOR;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("migrate")
        .version(env!("CARGO_PKG_VERSION"))
        .about("数据库迁移工具")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径（可选，默认只用环境变量）")
                .global(true),
        )
        .subcommand_required(true)
        .subcommand(Command::new("up").about("应用所有未执行的迁移"))
        .subcommand(Command::new("down").about("回滚最近一次迁移"))
        .subcommand(Command::new("version").about("显示当前迁移版本"))
        .subcommand(
            Command::new("force")
                .about("把记录的迁移版本强制为<VERSION>，不执行任何SQL")
                .arg(
                    Arg::new("version")
                        .value_name("VERSION")
                        .required(true)
                        .value_parser(clap::value_parser!(i64)),
                ),
        )
        .subcommand(
            Command::new("create")
                .about("生成一对带时间戳的空迁移文件")
                .arg(Arg::new("name").value_name("NAME").required(true)),
        )
        .get_matches();

    match matches.subcommand() {
        Some(("create", sub)) => {
            // 只写文件，不需要数据库
            let name = sub
                .get_one::<String>("name")
                .context("缺少迁移名称")?;
            create_migration(name)
        }
        Some(("up", _)) => {
            let pool = connect(&matches).await?;
            MIGRATOR.run(&pool).await.context("应用迁移失败")?;
            println!("迁移已应用");
            Ok(())
        }
        Some(("down", _)) => {
            let pool = connect(&matches).await?;
            run_down(&pool).await
        }
        Some(("version", _)) => {
            let pool = connect(&matches).await?;
            show_version(&pool).await
        }
        Some(("force", sub)) => {
            let pool = connect(&matches).await?;
            let version = *sub
                .get_one::<i64>("version")
                .context("缺少目标版本号")?;
            force_version(&pool, version).await
        }
        _ => unreachable!("clap已保证必须有子命令"),
    }
}

async fn connect(matches: &ArgMatches) -> Result<PgPool> {
    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let config = AppConfig::load(config_path).context("加载配置失败")?;

    PgPoolOptions::new()
        .max_connections(1)
        .connect(&config.database.url)
        .await
        .context("连接数据库失败")
}

async fn migrations_table_exists(pool: &PgPool) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = '_sqlx_migrations')",
    )
    .fetch_one(pool)
    .await
    .context("查询迁移记录表失败")?;
    Ok(exists)
}

/// 回滚最近一次已应用的迁移
async fn run_down(pool: &PgPool) -> Result<()> {
    if !migrations_table_exists(pool).await? {
        println!("尚未应用任何迁移");
        return Ok(());
    }

    let applied: Vec<i64> =
        sqlx::query_scalar("SELECT version FROM _sqlx_migrations ORDER BY version DESC")
            .fetch_all(pool)
            .await
            .context("读取迁移记录失败")?;

    let Some(latest) = applied.first() else {
        println!("尚未应用任何迁移");
        return Ok(());
    };

    // 回滚到上一个版本；只剩一个时回滚到0（空库）
    let target = applied.get(1).copied().unwrap_or(0);
    MIGRATOR
        .undo(pool, target)
        .await
        .with_context(|| format!("回滚迁移 {latest} 失败"))?;

    println!("已回滚迁移 {latest}");
    Ok(())
}

async fn show_version(pool: &PgPool) -> Result<()> {
    if !migrations_table_exists(pool).await? {
        println!("尚未应用任何迁移");
        return Ok(());
    }

    let latest: Option<(i64, String)> = sqlx::query_as(
        "SELECT version, description FROM _sqlx_migrations ORDER BY version DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await
    .context("读取迁移记录失败")?;

    match latest {
        Some((version, description)) => {
            println!("当前迁移版本: {version} ({description})");
        }
        None => println!("尚未应用任何迁移"),
    }
    Ok(())
}

/// 把迁移记录强制到指定版本，高于该版本的记录被清除
async fn force_version(pool: &PgPool, version: i64) -> Result<()> {
    if !migrations_table_exists(pool).await? {
        return Err(anyhow::anyhow!("迁移记录表不存在，无法强制版本"));
    }

    let deleted = sqlx::query("DELETE FROM _sqlx_migrations WHERE version > $1")
        .bind(version)
        .execute(pool)
        .await
        .context("清除迁移记录失败")?;

    println!(
        "迁移版本已强制为 {version}（清除 {} 条记录）",
        deleted.rows_affected()
    );
    Ok(())
}

/// 在migrations/目录下生成一对空的up/down迁移文件
fn create_migration(name: &str) -> Result<()> {
    let timestamp = Utc::now().format("%Y%m%d%H%M%S");
    let dir = Path::new("migrations");
    std::fs::create_dir_all(dir).context("创建migrations目录失败")?;

    println!("已创建迁移文件:");
    for suffix in ["up", "down"] {
        let path = dir.join(format!("{timestamp}_{name}.{suffix}.sql"));
        std::fs::write(&path, "")
            .with_context(|| format!("创建迁移文件失败: {}", path.display()))?;
        println!("  {}", path.display());
    }
    Ok(())
}

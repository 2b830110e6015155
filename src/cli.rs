use {
    caecod::{
        Database, Result,
        builder,
        config::{BuildConfig, ServerConfig},
        server::Server,
        tiles,
    },
    clap::Parser,
    std::path::PathBuf,
};

#[derive(Parser)]
#[command(
    name = "caecod",
    version,
    about = "Serve immutable HTTP responses out of a perfect-hash-indexed dataset",
    long_about = None
)]
#[command(group(clap::ArgGroup::new("mode").required(true)))]
pub struct Cli {
    /// Build a database from a manifest build config
    #[arg(short = 'b', value_name = "build.json", group = "mode")]
    build: Option<PathBuf>,

    /// Build a database from an MBTiles-shaped tile store
    #[arg(short = 't', value_name = "build.json", group = "mode")]
    tiles: Option<PathBuf>,

    /// Serve a database
    #[arg(short = 's', value_name = "server.json", group = "mode")]
    serve: Option<PathBuf>,

    /// Verify a database directory and print a summary
    #[arg(short = 'c', value_name = "db-dir", group = "mode")]
    check: Option<PathBuf>,
}

pub fn app() -> Result<()> {
    let argv = Cli::parse();

    if let Some(cfg) = argv.build {
        return builder::build(&BuildConfig::load(cfg)?);
    }

    if let Some(cfg) = argv.tiles {
        return tiles::build(&BuildConfig::load(cfg)?);
    }

    if let Some(cfg) = argv.serve {
        let cfg = ServerConfig::load(cfg)?;
        let db = Database::open(&cfg.db)?;
        return Server::bind(cfg, db)?.run();
    }

    if let Some(dir) = argv.check {
        let db = Database::open(&dir)?;
        db.verify_deep()?;
        println!("uuid:     {}", db.uuid());
        println!("records:  {}", db.records());
        println!("created:  {}", db.created());
        println!("data:     {} bytes", db.data_size());
        println!("ok");
    }

    Ok(())
}

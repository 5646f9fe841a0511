use log::{error, info};
use retex64::low_mip;
use retex64::replacement::{
    LOW_MIP_CACHE_FILENAME, REPLACEMENT_DATABASE_FILENAME, ReplacementDatabase,
};
use std::collections::BTreeSet;
use std::error::Error;
use std::fs;
use std::path::Path;

fn show_help() {
    eprintln!(
        "texture_packer <path> --create-low-mip-cache\n\
         \tGenerate the cache used for streaming textures in by extracting \
         the lowest quality mipmaps.\n\n\
         texture_packer <path> --create-pack\n\
         \tCreate the pack by including all the textures supported by the \
         database and the low mip cache.\n"
    );
}

enum Mode {
    CreateLowMipCache,
    CreatePack,
}

fn create_low_mip_cache(
    directory: &Path,
    paths: &BTreeSet<String>,
) -> Result<(), Box<dyn Error>> {
    let mut container = Vec::new();
    let total = paths.len();
    for (index, relative_path) in paths.iter().enumerate() {
        if index % 100 == 0 || index + 1 == total {
            info!("Processing ({}/{}): {}.", index, total, relative_path);
        }

        let dds_bytes = fs::read(directory.join(relative_path))
            .map_err(|e| format!("unable to open file at {relative_path}: {e}"))?;
        low_mip::extract_low_mips(&dds_bytes, relative_path, &mut container)
            .map_err(|e| format!("failed to extract low mips from {relative_path}: {e}"))?;
    }

    fs::write(directory.join(LOW_MIP_CACHE_FILENAME), container)?;
    Ok(())
}

fn run() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        show_help();
        return Err("missing arguments".into());
    }

    let directory = Path::new(&args[1]);
    if !directory.is_dir() {
        return Err(format!("the directory {} does not exist", directory.display()).into());
    }

    let mode = match args[2].as_str() {
        "--create-low-mip-cache" | "-m" => {
            info!("Creating low mip cache.");
            Mode::CreateLowMipCache
        }
        "--create-pack" | "-p" => {
            info!("Creating pack.");
            Mode::CreatePack
        }
        other => {
            show_help();
            return Err(format!("unrecognized argument {other}").into());
        }
    };

    let database_path = directory.join(REPLACEMENT_DATABASE_FILENAME);
    if !database_path.exists() {
        return Err(format!("database file {REPLACEMENT_DATABASE_FILENAME} is missing").into());
    }

    info!("Opening database file...");
    let database = ReplacementDatabase::from_reader(fs::File::open(&database_path)?)
        .map_err(|e| format!("JSON parsing error: {e}"))?;

    info!("Resolving database paths...");
    let only_dds = matches!(mode, Mode::CreateLowMipCache);
    let resolved = database.resolve_paths(directory, only_dds);

    // The same file may back several records; process each path once, in a
    // stable order.
    let paths: BTreeSet<String> = resolved
        .into_values()
        .map(|resolved| resolved.relative_path)
        .collect();

    match mode {
        Mode::CreateLowMipCache => create_low_mip_cache(directory, &paths),
        Mode::CreatePack => Err("pack creation is not available yet".into()),
    }
}

fn main() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .try_init();

    if let Err(e) = run() {
        error!("{e}");
        std::process::exit(1);
    }
}

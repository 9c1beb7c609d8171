//! pedalgrid-scan: list the LV2 plugins visible under a search path.
//!
//! Usage: pedalgrid-scan [SEARCH_PATH] [--json]
//!
//! Without `--json`, prints one line per plugin; with it, dumps the same
//! catalog JSON the control surface receives.

use pedalgrid::catalog::Catalog;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut search_path = String::new();
    let mut as_json = false;
    for arg in std::env::args().skip(1) {
        if arg == "--json" {
            as_json = true;
        } else {
            search_path = arg;
        }
    }

    let catalog = Catalog::new(&search_path);

    if as_json {
        println!("{}", catalog.to_json());
        return;
    }

    let mut entries: Vec<_> = catalog.entries().values().collect();
    entries.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    println!("Found {} LV2 plugins", entries.len());
    for entry in entries {
        println!(
            "- {} [{}] | {} ports | by {}",
            entry.name,
            entry.uri,
            entry.ports.len(),
            entry.author.as_deref().unwrap_or("unknown")
        );
    }
}

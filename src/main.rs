use sonicsim::{boot, cli};

fn main() -> anyhow::Result<()> {
    let matches = cli::parse_args();
    boot::init_logger(matches.get_one::<String>("log-file").map(String::as_str));
    boot::run(&matches)
}

use clap::Parser;

#[derive(Parser)]
#[command(version, about, long_about)]
pub struct Args {
    #[clap(default_value = "demo.ndb")]
    pub file: String,
}

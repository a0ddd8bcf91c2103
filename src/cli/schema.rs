use std::path::PathBuf;

use clap::Args;

use topicflow::schema::write_schema;

#[derive(Args, Debug)]
pub struct SchemaArgs {
    /// Directory the schemas are written to
    #[arg(long, default_value = "schemas")]
    pub out: PathBuf,
}

pub async fn execute(args: SchemaArgs) -> anyhow::Result<()> {
    for path in write_schema(&args.out)? {
        println!("wrote {}", path.display());
    }
    Ok(())
}

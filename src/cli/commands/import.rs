use clap::Args;

#[derive(Args, Debug, Clone)]
pub struct ImportCommand {
    /// Dataset to import
    pub dataset: String,

    /// Project owning the dataset (default: configured project)
    #[arg(long = "remote-project")]
    pub remote_project: Option<String>,

    /// Only import these tables
    #[arg(long = "limit-to", value_delimiter = ',', conflicts_with = "except")]
    pub limit_to: Vec<String>,

    /// Import every table but these
    #[arg(long, value_delimiter = ',')]
    pub except: Vec<String>,

    /// Host server name used in the generated statements
    #[arg(long, default_value = "bigquery_srv")]
    pub server: String,

    /// Host schema receiving the foreign tables
    #[arg(long = "local-schema", default_value = "public")]
    pub local_schema: String,

    /// Tables over the column limit: skip, trim or error
    #[arg(long, default_value = "skip")]
    pub colcount: String,

    /// Column names over the identifier limit: skip, trim or error
    #[arg(long, default_value = "skip")]
    pub colnames: String,

    /// Option added to every generated table
    #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
    pub options: Vec<String>,
}

use clap::Args;

#[derive(Args, Debug, Clone)]
pub struct TableArgs {
    /// Remote table as DATASET.TABLE or PROJECT.DATASET.TABLE
    #[arg(long, value_name = "TABLE", required_unless_present = "query")]
    pub table: Option<String>,

    /// Static query used instead of a table (fdw_query)
    #[arg(long, value_name = "SQL")]
    pub query: Option<String>,

    /// Declared column, optionally typed: NAME or NAME:TYPE
    #[arg(long = "column", value_name = "NAME[:TYPE]")]
    pub columns: Vec<String>,

    /// Foreign table option, e.g. -o fdw_sql_dialect=legacy
    #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
    pub options: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ScanCommand {
    #[command(flatten)]
    pub table: TableArgs,

    /// Columns to fetch (default: every declared column)
    #[arg(long = "select", value_name = "COLUMN", value_delimiter = ',')]
    pub select: Vec<String>,

    /// Filter condition, e.g. "a = 1" or "b IN ('x', 'y')"; repeat for AND
    #[arg(long = "where", value_name = "CONDITION")]
    pub conditions: Vec<String>,

    /// Sort key: COLUMN, COLUMN:desc, COLUMN:asc:nulls_first
    #[arg(long = "order-by", value_name = "KEY")]
    pub order_by: Vec<String>,

    #[arg(long)]
    pub limit: Option<u64>,
}

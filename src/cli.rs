use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "remctxd", about = "Remote execution runtime controller")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Spawn a local context and make one call against it.
    SpawnLocal {
        /// Name to give the new context.
        #[arg(long, default_value = "local")]
        name: String,

        /// Registered module name to call.
        #[arg(long)]
        call_module: String,

        /// Registered function name to call.
        #[arg(long)]
        call_func: String,

        /// Positional integer arguments to pass (simple demo encoding).
        #[arg(long = "arg")]
        args: Vec<i64>,

        /// Call deadline in milliseconds; unset blocks forever.
        #[arg(long)]
        deadline_ms: Option<u64>,
    },

    /// Spawn a context over SSH and make one call against it.
    SpawnSsh {
        /// Remote host to connect to.
        #[arg(long)]
        host: String,

        /// SSH username.
        #[arg(long)]
        user: Option<String>,

        /// Name to give the new context.
        #[arg(long, default_value = "remote")]
        name: String,

        /// Path to this runtime's binary on the remote host.
        #[arg(long, default_value = "remctxd")]
        remote_binary: String,

        /// Registered module name to call.
        #[arg(long)]
        call_module: String,

        /// Registered function name to call.
        #[arg(long)]
        call_func: String,

        /// Positional integer arguments to pass (simple demo encoding).
        #[arg(long = "arg")]
        args: Vec<i64>,

        /// Call deadline in milliseconds; unset blocks forever.
        #[arg(long)]
        deadline_ms: Option<u64>,
    },

    /// Internal: stage-one bootstrap entry point. Not for direct use.
    #[command(name = "bootstrap-stage1", hide = true)]
    BootstrapStage1 {
        /// Cosmetic context name (spec §4.7: set as argv[0] convention).
        context_name: String,
    },

    /// Internal: stage-two bootstrap entry point. Not for direct use.
    #[command(name = "bootstrap-stage2", hide = true)]
    BootstrapStage2 {
        /// Cosmetic context name; the authoritative name travels inside
        /// the marshalled `BootstrapConfig` read from stdin.
        context_name: String,
    },
}

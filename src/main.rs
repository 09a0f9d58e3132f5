use std::process::ExitCode;

use clap::Parser;

use gatt_session::{Args, fake_link_backend, real_link_backend, run};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let mut stdout = std::io::stdout();

    let run_result = async {
        let (invocation, maybe_fake_args) = args.into_invocation()?;
        let backend = match maybe_fake_args {
            Some(fake_args) => fake_link_backend(fake_args),
            None => real_link_backend(),
        };

        run(invocation, &mut stdout, backend).await
    }
    .await;

    match run_result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(1)
        }
    }
}

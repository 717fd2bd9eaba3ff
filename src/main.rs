use std::process::ExitCode;

use burn::tensor::backend::AutodiffBackend;
use clap::Parser;

use style_transfer::StyleTransferError;
use style_transfer::cli::Cli;
use style_transfer::logger::install_logging;
use style_transfer::pipeline;

fn launch<B: AutodiffBackend>(cli: &Cli, device: B::Device) -> ExitCode {
    match pipeline::run::<B>(cli, &device) {
        Ok(outputs) => {
            log::info!("Wrote {} images", outputs.len());
            ExitCode::SUCCESS
        }
        Err(err) => {
            log::error!("{err}");
            match err {
                StyleTransferError::MissingFile(_) => ExitCode::from(1),
                _ => ExitCode::from(3),
            }
        }
    }
}

#[cfg(feature = "ndarray")]
fn run(cli: &Cli) -> ExitCode {
    use burn::backend::{Autodiff, NdArray, ndarray::NdArrayDevice};

    launch::<Autodiff<NdArray>>(cli, NdArrayDevice::Cpu)
}

#[cfg(all(not(feature = "ndarray"), feature = "tch-gpu"))]
fn run(cli: &Cli) -> ExitCode {
    use burn::backend::{Autodiff, LibTorch, libtorch::LibTorchDevice};

    #[cfg(not(target_os = "macos"))]
    let device = LibTorchDevice::Cuda(0);
    #[cfg(target_os = "macos")]
    let device = LibTorchDevice::Mps;

    launch::<Autodiff<LibTorch>>(cli, device)
}

#[cfg(all(not(feature = "ndarray"), not(feature = "tch-gpu"), feature = "tch-cpu"))]
fn run(cli: &Cli) -> ExitCode {
    use burn::backend::{Autodiff, LibTorch, libtorch::LibTorchDevice};

    launch::<Autodiff<LibTorch>>(cli, LibTorchDevice::Cpu)
}

#[cfg(all(
    not(feature = "ndarray"),
    not(feature = "tch-gpu"),
    not(feature = "tch-cpu"),
    feature = "wgpu"
))]
fn run(cli: &Cli) -> ExitCode {
    use burn::backend::{Autodiff, Wgpu, wgpu::WgpuDevice};

    launch::<Autodiff<Wgpu>>(cli, WgpuDevice::default())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    install_logging();

    run(&cli)
}

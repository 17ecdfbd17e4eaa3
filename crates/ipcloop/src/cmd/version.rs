use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("ipcloop {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: ipcloop");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "target: {}",
        option_env!("IPCLOOP_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!(
        "wire: magic=IPCL header={}B default_max_frame={}B",
        ipcloop_frame::HEADER_SIZE,
        ipcloop_frame::DEFAULT_MAX_FRAME_SIZE
    );
    println!(
        "features: channel={}, cli=true",
        cfg!(feature = "channel")
    );

    Ok(SUCCESS)
}

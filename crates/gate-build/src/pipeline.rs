use gate_image::{Instance, Program, Storage};
use gate_types::{Buffers, Result};
use tracing::debug;

use crate::builder::Builder;
use crate::compile::{Compiler, ImportResolver};
use crate::config::BuildConfig;

/// Result of [`build`].
#[derive(Debug)]
pub struct BuildOutput {
    pub program: Program,
    /// Present if requested by the configuration.
    pub instance: Option<Instance>,
    /// I/O buffers restored from a snapshot.
    pub buffers: Buffers,
}

/// Build a program (and optionally an instance) from module bytes.
pub fn build(
    storage: Storage,
    module: &[u8],
    config: &BuildConfig,
    compiler: &mut dyn Compiler,
    resolver: &mut dyn ImportResolver,
) -> Result<BuildOutput> {
    let mut b = Builder::new(storage, module, config.max_text_size, config.want_instance)?;
    let result = run(&mut b, config, compiler, resolver);
    b.close();
    result
}

fn run(
    b: &mut Builder<'_>,
    config: &BuildConfig,
    compiler: &mut dyn Compiler,
    resolver: &mut dyn ImportResolver,
) -> Result<BuildOutput> {
    b.load_custom_sections()?;

    b.set_stack_size(config.stack_size);
    if config.want_instance {
        b.set_max_memory_size(config.max_memory_size)?;
    }

    b.bind_functions(resolver, &config.entry)?;

    b.compile_code(compiler)?;
    b.verify_breakpoints()?;

    b.install_snapshot_data_loaders();
    b.load_custom_sections()?;
    b.finish_image_text()?;

    b.install_late_snapshot_loaders();
    b.init_data()?;
    b.load_custom_sections()?;

    let program = b.finish_program_image()?;
    let instance = if config.want_instance {
        Some(b.finish_instance_image(&program)?)
    } else {
        None
    };

    debug!(
        module_size = program.module_size(),
        text_size = program.text_size(),
        instance = instance.is_some(),
        "build finished"
    );

    Ok(BuildOutput {
        program,
        instance,
        buffers: b.take_buffers(),
    })
}

use daplink_target::{Registry, TargetDescriptionSource};

#[derive(clap::Parser)]
pub struct Cmd {}

impl Cmd {
    pub fn run(self, registry: &Registry) -> anyhow::Result<()> {
        if registry.targets().is_empty() {
            println!("No boards are known.");
            return Ok(());
        }

        println!("The following boards are known:");
        for target in registry.targets() {
            let source = match target.source {
                TargetDescriptionSource::BuiltIn => "",
                TargetDescriptionSource::External => " (external)",
            };
            println!("{}: {}{}", target.board_id, target.name, source);
        }
        Ok(())
    }
}

//! Stage-aware prompt construction.
//!
//! The base instructions are tuned against false positives: leftover purge
//! blobs and debris from earlier prints must never read as a failure. Stage
//! guidance tells the model how much material it should expect to see.

use crate::config::StageBands;

const BASE_INSTRUCTIONS: &str = "You are a 3D print failure detector looking at a single frame from a webcam fixed on the build area of a 3D printer.

PRINTER CONTEXT:
- The build plate may carry glue, tape or a textured surface. This is NORMAL.
- The toolhead moves quickly and can appear blurred. This is NORMAL.

{stage}

NORMAL, do NOT flag:
- Glue residue, tape or surface treatments on the plate
- Purge lines, purge blobs and wipe towers anywhere on the bed
- Skirts and brims around the parts
- Thin first layers early in the print
- Motion blur on the toolhead or gantry
- Light stringing between nearby parts
- Pre-existing objects, blobs, filament scraps or debris sitting on the bed. They are leftovers from earlier prints, however colorful or tangled they look, and they are NOT an active failure.
- Static clumps of filament that are not connected to the nozzle

FAILURE, flag only when it is CLEARLY happening right now:
- Spaghetti: the nozzle is actively extruding a chaotic tangle instead of structured layers, connected to the nozzle or the part being printed
- Detachment: a part being printed has fallen over, moved, or peeled off the bed
- Printing into air: the nozzle extrudes high above the bed with nothing underneath

RULES:
1. Be conservative. A false positive stops the print and wastes time and material.
2. Unless you are at least 95% sure an ACTIVE failure is happening, answer OK.
3. Anything messy that is not connected to the nozzle or the active print is debris. Answer OK.

Answer with EXACTLY one line, either
VERDICT: OK
or
VERDICT: FAIL | <brief reason>";

/// Print stage used to pick the guidance text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Early,
    Mid,
    Late,
}

impl Stage {
    /// Classify the print stage from layer and progress.
    pub fn classify(bands: &StageBands, layer: Option<u32>, progress: f32) -> Stage {
        let early = match layer {
            Some(layer) => layer <= bands.early_layer_max,
            None => progress < bands.early_progress_max,
        };
        if early {
            Stage::Early
        } else if progress > bands.late_progress_min {
            Stage::Late
        } else {
            Stage::Mid
        }
    }
}

/// Builds the text sent alongside each snapshot.
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    bands: StageBands,
}

impl PromptBuilder {
    pub fn new(bands: StageBands) -> Self {
        Self { bands }
    }

    /// Build the prompt for the current print position.
    ///
    /// A non-empty `custom` prompt is returned verbatim with no stage
    /// guidance injected.
    pub fn build(
        &self,
        custom: Option<&str>,
        layer: Option<u32>,
        total_layers: Option<u32>,
        progress: f32,
    ) -> String {
        if let Some(custom) = custom.filter(|c| !c.trim().is_empty()) {
            return custom.to_string();
        }
        let stage = Stage::classify(&self.bands, layer, progress);
        BASE_INSTRUCTIONS.replace("{stage}", &stage_guidance(stage, layer, total_layers, progress))
    }
}

fn stage_guidance(stage: Stage, layer: Option<u32>, total_layers: Option<u32>, progress: f32) -> String {
    let layer = layer.map_or_else(|| "?".to_string(), |l| l.to_string());
    let total = total_layers.map_or_else(|| "?".to_string(), |t| t.to_string());
    let position = format!("layer {}/{}", layer, total);

    match stage {
        Stage::Early => format!(
            "STAGE: Early print ({}, {:.0}%). Only outlines, skirts and the first layers are on the bed. Very little material is visible and that is NORMAL. Do NOT flag thin or sparse prints at this stage.",
            position, progress
        ),
        Stage::Mid => format!(
            "STAGE: Mid print ({}, {:.0}%). Parts should be visibly forming from stacked layers. Some height is expected.",
            position, progress
        ),
        Stage::Late => format!(
            "STAGE: Late print ({}, {:.0}%). Parts should be nearly complete, with full height and defined shapes.",
            position, progress
        ),
    }
}

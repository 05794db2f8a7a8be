//! Planner node: turns a goal string into a topologically ordered plan.
//!
//! Grounded on `PlannerNode` in `ai/graph/nodes/planner.py`: command-prefix
//! templates first, keyword heuristics as a fallback, single-step image
//! generation as the ultimate fallback.

use crate::model::{ErrorRecord, ErrorSeverity, PlanItem, UserRole};
use regex::Regex;

pub struct Planner {
    patterns: Vec<(Regex, CommandKind)>,
}

#[derive(Clone, Copy)]
enum CommandKind {
    Image,
    Animation,
    SpeechRecognition,
    TextToSpeech,
    Upload,
    CreativeWorkflow,
}

impl Default for Planner {
    fn default() -> Self {
        Self::new()
    }
}

impl Planner {
    pub fn new() -> Self {
        let patterns = vec![
            (r"^/img\s+(.+)", CommandKind::Image),
            (r"^/image\s+(.+)", CommandKind::Image),
            (r"^/anim\s+(.+)", CommandKind::Animation),
            (r"^/video\s+(.+)", CommandKind::Animation),
            (r"^/asr\s+(.+)", CommandKind::SpeechRecognition),
            (r"^/tts\s+(.+)", CommandKind::TextToSpeech),
            (r"^/voice\s+(.+)", CommandKind::TextToSpeech),
            (r"^/upload\s+(.+)", CommandKind::Upload),
            (r"^/share\s+(.+)", CommandKind::Upload),
            (r"^/create\s+(.+)", CommandKind::CreativeWorkflow),
            (r"^/complete\s+(.+)", CommandKind::CreativeWorkflow),
        ]
        .into_iter()
        .map(|(pattern, kind)| (Regex::new(&format!("(?i){pattern}")).expect("static pattern"), kind))
        .collect();

        Self { patterns }
    }

    /// Builds a plan from `goal`, returning the plan and, on total failure,
    /// an error record the caller should attach to the session.
    pub fn plan(&self, goal: &str, role: UserRole) -> (Vec<PlanItem>, Option<ErrorRecord>) {
        let trimmed = goal.trim();

        for (pattern, kind) in &self.patterns {
            if let Some(captures) = pattern.captures(trimmed) {
                let prompt = captures.get(1).map(|m| m.as_str().trim()).unwrap_or("");
                let items = self.build(*kind, prompt, role);
                return (resolve_order(items), None);
            }
        }

        let items = self.intelligent_fallback(trimmed, role);
        if items.is_empty() {
            let error = ErrorRecord::new(ErrorSeverity::Error, "no valid plan could be created from goal");
            return (Vec::new(), Some(error));
        }
        (resolve_order(items), None)
    }

    fn build(&self, kind: CommandKind, prompt: &str, role: UserRole) -> Vec<PlanItem> {
        match kind {
            CommandKind::Image => self.image_generation(prompt, role),
            CommandKind::Animation => self.animation(prompt),
            CommandKind::SpeechRecognition => vec![speech_recognition_item(prompt)],
            CommandKind::TextToSpeech => vec![text_to_speech_item(prompt)],
            CommandKind::Upload => self.upload(prompt),
            CommandKind::CreativeWorkflow => self.creative_workflow(prompt, role),
        }
    }

    fn image_generation(&self, prompt: &str, role: UserRole) -> Vec<PlanItem> {
        let generate = image_generation_item(prompt);
        let mut items = vec![generate];
        if !matches!(role, UserRole::Guest) {
            let upscale = upscale_item().depends_on([items[0].id.clone()]);
            items.push(upscale);
        }
        items
    }

    fn animation(&self, prompt: &str) -> Vec<PlanItem> {
        let generate = image_generation_item(prompt);
        let animate = animation_item().depends_on([generate.id.clone()]);
        vec![generate, animate]
    }

    fn upload(&self, content_desc: &str) -> Vec<PlanItem> {
        let lower = content_desc.to_lowercase();
        let destination = if lower.contains("telegram") {
            Some("telegram")
        } else if lower.contains("local") {
            Some("local")
        } else {
            None
        };

        match destination {
            Some(dest) => vec![upload_item(content_desc, dest)],
            None => vec![upload_item(content_desc, "local"), upload_item(content_desc, "telegram")],
        }
    }

    fn creative_workflow(&self, prompt: &str, role: UserRole) -> Vec<PlanItem> {
        let generate = image_generation_item(prompt);
        let upscale = upscale_item().depends_on([generate.id.clone()]);
        let animate = animation_item().depends_on([upscale.id.clone()]);
        let mut items = vec![generate, upscale, animate];

        if !matches!(role, UserRole::Guest) {
            let upload = upload_item(prompt, "local").depends_on([items[2].id.clone()]);
            items.push(upload);
        }
        items
    }

    fn intelligent_fallback(&self, goal: &str, role: UserRole) -> Vec<PlanItem> {
        let lower = goal.to_lowercase();
        if lower.is_empty() {
            return Vec::new();
        }
        if ["bild", "image", "foto", "picture"].iter().any(|w| lower.contains(w)) {
            self.image_generation(goal, role)
        } else if ["video", "animation", "anim"].iter().any(|w| lower.contains(w)) {
            self.animation(goal)
        } else if ["sprache", "voice", "speak"].iter().any(|w| lower.contains(w)) {
            vec![text_to_speech_item(goal)]
        } else {
            self.image_generation(goal, role)
        }
    }
}

fn image_generation_item(prompt: &str) -> PlanItem {
    PlanItem::new(uuid::Uuid::new_v4().to_string(), "sd_generate", serde_json::json!({
        "prompt": prompt,
        "model": "sd15",
        "width": 512,
        "height": 512,
        "steps": 20,
        "cfg_scale": 7.0,
    }))
    .with_max_retries(2)
    .with_gpu(true)
    .with_estimated_duration(15.0)
}

fn upscale_item() -> PlanItem {
    PlanItem::new(uuid::Uuid::new_v4().to_string(), "upscale_image", serde_json::json!({
        "scale_factor": 2,
        "model": "RealESRGAN_x2plus",
    }))
    .with_max_retries(1)
    .with_gpu(true)
    .with_estimated_duration(30.0)
}

fn animation_item() -> PlanItem {
    PlanItem::new(uuid::Uuid::new_v4().to_string(), "generate_animation", serde_json::json!({
        "animation_type": "video",
        "duration_s": 3,
        "fps": 24,
    }))
    .with_max_retries(1)
    .with_gpu(true)
    .with_estimated_duration(60.0)
}

fn speech_recognition_item(audio_input: &str) -> PlanItem {
    PlanItem::new(uuid::Uuid::new_v4().to_string(), "transcribe_audio", serde_json::json!({
        "audio_input": audio_input,
        "model": "whisper-base",
    }))
    .with_max_retries(2)
    .with_estimated_duration(10.0)
}

fn text_to_speech_item(text: &str) -> PlanItem {
    PlanItem::new(uuid::Uuid::new_v4().to_string(), "synthesize_speech", serde_json::json!({
        "text": text,
        "voice": "default-speaker",
        "speed": 1.0,
    }))
    .with_max_retries(2)
    .with_estimated_duration(5.0)
}

fn upload_item(description: &str, destination: &str) -> PlanItem {
    PlanItem::new(uuid::Uuid::new_v4().to_string(), "upload_file", serde_json::json!({
        "description": description,
        "destination": destination,
    }))
    .with_max_retries(3)
    .with_estimated_duration(45.0)
}

/// Topologically sorts plan items so a dependency always precedes its
/// dependents. Falls back to input order for an unresolved (cyclic or
/// orphaned) remainder rather than dropping items.
fn resolve_order(items: Vec<PlanItem>) -> Vec<PlanItem> {
    let mut resolved: Vec<PlanItem> = Vec::new();
    let mut remaining = items;

    while !remaining.is_empty() {
        let resolved_ids: Vec<&str> = resolved.iter().map(|i| i.id.as_str()).collect();
        let (ready, not_ready): (Vec<PlanItem>, Vec<PlanItem>) = remaining
            .into_iter()
            .partition(|item| item.dependencies.iter().all(|dep| resolved_ids.contains(&dep.as_str())));

        if ready.is_empty() {
            resolved.extend(not_ready);
            break;
        }

        resolved.extend(ready);
        remaining = not_ready;
    }

    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_command_generates_with_upscale_for_user() {
        let planner = Planner::new();
        let (plan, error) = planner.plan("/img a cat in space", UserRole::User);
        assert!(error.is_none());
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].action, "sd_generate");
        assert_eq!(plan[1].action, "upscale_image");
        assert_eq!(plan[1].dependencies, vec![plan[0].id.clone()]);
    }

    #[test]
    fn image_command_skips_upscale_for_guest() {
        let planner = Planner::new();
        let (plan, _) = planner.plan("/img a cat", UserRole::Guest);
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn anim_command_chains_generate_then_animate() {
        let planner = Planner::new();
        let (plan, _) = planner.plan("/anim a dragon flying", UserRole::User);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[1].action, "generate_animation");
    }

    #[test]
    fn upload_without_destination_keyword_targets_both_destinations() {
        let planner = Planner::new();
        let (plan, _) = planner.plan("/upload my latest render", UserRole::User);
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn create_command_gates_upload_on_role() {
        let planner = Planner::new();
        let (admin_plan, _) = planner.plan("/create a sunset", UserRole::Admin);
        let (guest_plan, _) = planner.plan("/create a sunset", UserRole::Guest);
        assert_eq!(admin_plan.len(), 4);
        assert_eq!(guest_plan.len(), 3);
    }

    #[test]
    fn unrecognized_goal_falls_back_to_image_generation() {
        let planner = Planner::new();
        let (plan, error) = planner.plan("surprise me", UserRole::User);
        assert!(error.is_none());
        assert_eq!(plan[0].action, "sd_generate");
    }

    #[test]
    fn empty_goal_produces_an_error_and_no_plan() {
        let planner = Planner::new();
        let (plan, error) = planner.plan("   ", UserRole::User);
        assert!(plan.is_empty());
        assert!(error.is_some());
    }
}

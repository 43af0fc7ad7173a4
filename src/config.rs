use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;

use crate::scene::{self, description, Scene};

pub const DEFAULT_SCREENSHOT: &str = "screenshot.ppm";
const DEFAULT_SCENE: &str = "dungeon";

#[derive(Parser, Debug)]
#[command(version, about = "Hardware ray traced dungeon walkthrough")]
pub struct Args {
    /// initial window width
    #[arg(long)]
    width: Option<u32>,

    /// initial window height
    #[arg(long)]
    height: Option<u32>,

    /// render this many frames then exit, 0 runs until closed
    #[arg(long)]
    frames: Option<u64>,

    /// write a capture of the last frame on exit
    #[arg(long, num_args = 0..=1, default_missing_value = DEFAULT_SCREENSHOT)]
    screenshot: Option<PathBuf>,

    /// small window, a few frames and a screenshot
    #[arg(long)]
    test: bool,

    /// built-in scene name or a TOML scene file
    #[arg(long)]
    scene: Option<String>,

    #[arg(long, default_value = "shaders")]
    shader_dir: PathBuf,

    /// leave the cursor alone and disable mouse look
    #[arg(long)]
    editor_mode: bool,

    #[arg(long, overrides_with = "no_validation")]
    validation: bool,

    #[arg(long, overrides_with = "validation")]
    no_validation: bool,

    /// frames per second cap, 0 disables pacing
    #[arg(long)]
    fps_limit: Option<f32>,

    #[arg(long)]
    verbose: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SceneSource {
    Builtin(String),
    File(PathBuf),
}

impl SceneSource {
    pub fn load(&self) -> Result<Scene> {
        match self {
            SceneSource::Builtin(name) => match scene::builtin(name) {
                Some(scene) => Ok(scene),
                None => bail!("no built-in scene named '{name}'"),
            },
            SceneSource::File(path) => description::load_scene(path),
        }
    }
}

/// Arguments with every preset and default applied.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub width: u32,
    pub height: u32,
    /// `None` runs until the window closes
    pub frames: Option<u64>,
    pub screenshot: Option<PathBuf>,
    pub scene: SceneSource,
    pub shader_dir: PathBuf,
    pub editor_mode: bool,
    pub validation: bool,
    /// `None` renders as fast as presentation allows
    pub fps_limit: Option<f32>,
    pub verbose: bool,
}

impl Args {
    pub fn resolve(self) -> Result<RunConfig> {
        // explicit options win over the preset
        let (width, height, frames, screenshot) = if self.test {
            (
                self.width.unwrap_or(640),
                self.height.unwrap_or(480),
                self.frames.unwrap_or(5),
                self.screenshot
                    .or_else(|| Some(PathBuf::from(DEFAULT_SCREENSHOT))),
            )
        } else {
            (
                self.width.unwrap_or(1280),
                self.height.unwrap_or(720),
                self.frames.unwrap_or(0),
                self.screenshot,
            )
        };

        if width == 0 || height == 0 {
            bail!("window size {width}x{height} must be non-zero");
        }

        let fps_limit = self.fps_limit.unwrap_or(60.0);
        if !fps_limit.is_finite() || fps_limit < 0.0 {
            bail!("fps limit must be a non-negative number, got {fps_limit}");
        }

        let validation = if self.validation {
            true
        } else if self.no_validation {
            false
        } else {
            cfg!(debug_assertions)
        };

        let scene = match self.scene {
            None => SceneSource::Builtin(DEFAULT_SCENE.to_owned()),
            Some(name) if scene::BUILTIN_SCENES.contains(&name.as_str()) => {
                SceneSource::Builtin(name)
            }
            Some(path) => SceneSource::File(PathBuf::from(path)),
        };

        Ok(RunConfig {
            width,
            height,
            frames: (frames > 0).then_some(frames),
            screenshot,
            scene,
            shader_dir: self.shader_dir,
            editor_mode: self.editor_mode,
            validation,
            fps_limit: (fps_limit > 0.0).then_some(fps_limit),
            verbose: self.verbose,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(args: &[&str]) -> Result<RunConfig> {
        let args = Args::try_parse_from(std::iter::once("dungeon-rt").chain(args.iter().copied()))?;
        args.resolve()
    }

    #[test]
    fn defaults() {
        let config = resolve(&[]).unwrap();
        assert_eq!((config.width, config.height), (1280, 720));
        assert_eq!(config.frames, None);
        assert_eq!(config.screenshot, None);
        assert_eq!(config.scene, SceneSource::Builtin("dungeon".into()));
        assert_eq!(config.shader_dir, PathBuf::from("shaders"));
        assert_eq!(config.fps_limit, Some(60.0));
        assert_eq!(config.validation, cfg!(debug_assertions));
        assert!(!config.editor_mode);
    }

    #[test]
    fn test_preset() {
        let config = resolve(&["--test"]).unwrap();
        assert_eq!((config.width, config.height), (640, 480));
        assert_eq!(config.frames, Some(5));
        assert_eq!(config.screenshot, Some(PathBuf::from(DEFAULT_SCREENSHOT)));
    }

    #[test]
    fn explicit_options_beat_test_preset() {
        let config =
            resolve(&["--test", "--frames", "12", "--width", "320", "--screenshot", "out.ppm"])
                .unwrap();
        assert_eq!((config.width, config.height), (320, 480));
        assert_eq!(config.frames, Some(12));
        assert_eq!(config.screenshot, Some(PathBuf::from("out.ppm")));
    }

    #[test]
    fn bare_screenshot_uses_default_path() {
        let config = resolve(&["--screenshot"]).unwrap();
        assert_eq!(config.screenshot, Some(PathBuf::from(DEFAULT_SCREENSHOT)));
    }

    #[test]
    fn zero_disables_limits() {
        let config = resolve(&["--frames", "0", "--fps-limit", "0"]).unwrap();
        assert_eq!(config.frames, None);
        assert_eq!(config.fps_limit, None);
    }

    #[test]
    fn scene_names_and_paths() {
        let config = resolve(&["--scene", "cube"]).unwrap();
        assert_eq!(config.scene, SceneSource::Builtin("cube".into()));

        let config = resolve(&["--scene", "levels/crypt.toml"]).unwrap();
        assert_eq!(
            config.scene,
            SceneSource::File(PathBuf::from("levels/crypt.toml"))
        );
    }

    #[test]
    fn validation_flags() {
        assert!(resolve(&["--validation"]).unwrap().validation);
        assert!(!resolve(&["--no-validation"]).unwrap().validation);
        // last one wins
        assert!(!resolve(&["--validation", "--no-validation"]).unwrap().validation);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(resolve(&["--width", "0"]).is_err());
        assert!(resolve(&["--fps-limit", "-5"]).is_err());
        assert!(resolve(&["--bogus"]).is_err());
    }

    #[test]
    fn builtin_sources_load() {
        let scene = SceneSource::Builtin("cube".into()).load().unwrap();
        assert_eq!(scene.objects.len(), 1);
        assert!(SceneSource::Builtin("castle".into()).load().is_err());
    }
}

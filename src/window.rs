use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use anyhow::Result;
use ash::{vk, Entry, Instance};
use log::debug;
use winit::event::WindowEvent;
use winit::raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::window::Window;

/// How often the drawable size is polled while the window is minimized
/// before a swapchain recreation gives up for this cycle.
pub const MINIMIZED_POLL_ATTEMPTS: u32 = 100;
const MINIMIZED_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// What the frame context needs from whatever owns the platform window.
pub trait SurfaceSource {
    /// Current drawable size in physical pixels. Zero while minimized.
    fn drawable_size(&self) -> (u32, u32);

    fn was_resized(&self) -> bool;
    fn reset_resized(&mut self);

    /// # Safety
    /// `instance` must have been created with the extensions the platform needs
    /// and must outlive the returned surface.
    unsafe fn create_surface(&self, entry: &Entry, instance: &Instance) -> Result<vk::SurfaceKHR>;

    /// Called between polls while waiting for a non-zero size.
    fn idle(&mut self) {
        std::thread::sleep(MINIMIZED_POLL_INTERVAL);
    }
}

/// Polls `source` until both dimensions are non-zero, at most `attempts` times.
pub fn wait_for_drawable_size(
    source: &mut impl SurfaceSource,
    attempts: u32,
) -> Option<(u32, u32)> {
    for _ in 0..attempts {
        let (width, height) = source.drawable_size();
        if width > 0 && height > 0 {
            return Some((width, height));
        }
        source.idle();
    }
    None
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WindowBounds {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

pub struct WindowData {
    window: Window,
    resized: bool,
    bounds: WindowBounds,
}

impl WindowData {
    pub fn new(window: Window) -> WindowData {
        let size = window.inner_size();
        let position = window.outer_position().unwrap_or_default();
        WindowData {
            window,
            resized: false,
            bounds: WindowBounds {
                x: position.x,
                y: position.y,
                width: size.width,
                height: size.height,
            },
        }
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    pub fn bounds(&self) -> WindowBounds {
        self.bounds
    }

    /// Tracks geometry changes for this window.
    pub fn observe(&mut self, event: &WindowEvent) {
        match event {
            WindowEvent::Resized(size) => {
                self.resized = true;
                self.bounds.width = size.width;
                self.bounds.height = size.height;
            }
            WindowEvent::Moved(position) => {
                self.bounds.x = position.x;
                self.bounds.y = position.y;
            }
            WindowEvent::ScaleFactorChanged { .. } => self.resized = true,
            _ => (),
        }
    }
}

impl SurfaceSource for WindowData {
    fn drawable_size(&self) -> (u32, u32) {
        let size = self.window.inner_size();
        (size.width, size.height)
    }

    fn was_resized(&self) -> bool {
        self.resized
    }

    fn reset_resized(&mut self) {
        self.resized = false;
    }

    unsafe fn create_surface(&self, entry: &Entry, instance: &Instance) -> Result<vk::SurfaceKHR> {
        let display_handle = self.window.display_handle()?;
        let window_handle = self.window.window_handle()?;
        let surface = ash_window::create_surface(
            entry,
            instance,
            display_handle.as_raw(),
            window_handle.as_raw(),
            None,
        )?;
        debug!("created surface for window {:?}", self.window.id());
        Ok(surface)
    }
}

/// Per-window state keyed by the platform window id. Events are routed through
/// here instead of any process-wide hook, so more than one window can coexist.
pub struct WindowRegistry<K, T> {
    entries: HashMap<K, T>,
    primary: Option<K>,
}

impl<K: Hash + Eq + Copy, T> WindowRegistry<K, T> {
    pub fn new() -> Self {
        WindowRegistry {
            entries: HashMap::new(),
            primary: None,
        }
    }

    /// Registers `data` under `id`. The first registered window becomes primary.
    pub fn register(&mut self, id: K, data: T) -> Option<T> {
        if self.primary.is_none() {
            self.primary = Some(id);
        }
        self.entries.insert(id, data)
    }

    pub fn get_mut(&mut self, id: K) -> Option<&mut T> {
        self.entries.get_mut(&id)
    }

    pub fn primary(&self) -> Option<&T> {
        self.primary.and_then(|id| self.entries.get(&id))
    }

    pub fn primary_mut(&mut self) -> Option<&mut T> {
        self.primary.and_then(|id| self.entries.get_mut(&id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeWindow {
        sizes: Vec<(u32, u32)>,
        polls: usize,
        idles: usize,
        resized: bool,
    }

    impl FakeWindow {
        fn new(sizes: Vec<(u32, u32)>) -> Self {
            FakeWindow {
                sizes,
                polls: 0,
                idles: 0,
                resized: true,
            }
        }
    }

    impl SurfaceSource for FakeWindow {
        fn drawable_size(&self) -> (u32, u32) {
            let i = self.polls.min(self.sizes.len() - 1);
            self.sizes[i]
        }

        fn was_resized(&self) -> bool {
            self.resized
        }

        fn reset_resized(&mut self) {
            self.resized = false;
        }

        unsafe fn create_surface(&self, _: &Entry, _: &Instance) -> Result<vk::SurfaceKHR> {
            unreachable!("surface creation is not exercised here")
        }

        fn idle(&mut self) {
            self.polls += 1;
            self.idles += 1;
        }
    }

    #[test]
    fn minimized_window_exhausts_poll_budget() {
        let mut window = FakeWindow::new(vec![(0, 0)]);
        assert_eq!(wait_for_drawable_size(&mut window, MINIMIZED_POLL_ATTEMPTS), None);
        assert_eq!(window.idles, MINIMIZED_POLL_ATTEMPTS as usize);
    }

    #[test]
    fn zero_height_counts_as_minimized() {
        let mut window = FakeWindow::new(vec![(800, 0)]);
        assert_eq!(wait_for_drawable_size(&mut window, 3), None);
    }

    #[test]
    fn restored_window_is_picked_up_mid_poll() {
        let mut window = FakeWindow::new(vec![(0, 0), (0, 0), (640, 480)]);
        assert_eq!(wait_for_drawable_size(&mut window, 10), Some((640, 480)));
        assert_eq!(window.idles, 2);
    }

    #[test]
    fn visible_window_returns_immediately() {
        let mut window = FakeWindow::new(vec![(1280, 720)]);
        assert_eq!(wait_for_drawable_size(&mut window, 10), Some((1280, 720)));
        assert_eq!(window.idles, 0);
        assert!(window.was_resized());
        window.reset_resized();
        assert!(!window.was_resized());
    }

    #[test]
    fn registry_first_window_is_primary() {
        let mut registry: WindowRegistry<u64, &str> = WindowRegistry::new();
        assert!(registry.primary().is_none());
        registry.register(7, "main");
        registry.register(9, "tool");
        assert_eq!(registry.primary(), Some(&"main"));
        assert_eq!(registry.get_mut(9).map(|x| *x), Some("tool"));
    }

    #[test]
    fn registry_unknown_ids_are_ignored() {
        let mut registry: WindowRegistry<u64, u32> = WindowRegistry::new();
        registry.register(1, 10);
        assert!(registry.get_mut(2).is_none());
        assert_eq!(registry.primary(), Some(&10));
    }

    #[test]
    fn registry_register_replaces_existing_entry() {
        let mut registry: WindowRegistry<u64, u32> = WindowRegistry::new();
        assert_eq!(registry.register(3, 1), None);
        assert_eq!(registry.register(3, 2), Some(1));
        if let Some(x) = registry.primary_mut() {
            *x += 1;
        }
        assert_eq!(registry.primary(), Some(&3));
    }
}

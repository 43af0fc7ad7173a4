use std::borrow::Cow;
use std::ffi::{c_void, CStr};

use anyhow::Result;
use ash::{ext, vk};
use log::{debug, error, info, trace, warn};

pub struct DebugUtilsData {
    loader: ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl DebugUtilsData {
    /// # Safety
    /// `loader` must come from a live instance that outlives the returned value.
    pub unsafe fn new(
        loader: ext::debug_utils::Instance,
        create_info: &vk::DebugUtilsMessengerCreateInfoEXT,
    ) -> Result<DebugUtilsData> {
        let messenger = loader.create_debug_utils_messenger(create_info, None)?;
        debug!("installed debug utils messenger");
        Ok(DebugUtilsData { loader, messenger })
    }
}

impl Drop for DebugUtilsData {
    fn drop(&mut self) {
        unsafe {
            self.loader
                .destroy_debug_utils_messenger(self.messenger, None)
        };
    }
}

pub unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let message = if callback_data.is_null() || (*callback_data).p_message.is_null() {
        Cow::Borrowed("<no message>")
    } else {
        CStr::from_ptr((*callback_data).p_message).to_string_lossy()
    };

    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => error!("[vk {message_type:?}] {message}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => warn!("[vk {message_type:?}] {message}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => info!("[vk {message_type:?}] {message}"),
        _ => trace!("[vk {message_type:?}] {message}"),
    }

    // returning true would abort the call that triggered the message
    vk::FALSE
}

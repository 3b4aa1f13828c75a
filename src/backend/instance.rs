// Vulkan Instance - process-wide API context
//
// Responsibilities:
// - Library loading + instance creation
// - Validation layers (only when actually available)
// - Debug messenger routed into the `log` facade
// - Owns the lifetime tracker every other wrapper reports to

use anyhow::{Context, Result};
use ash::vk::Handle;
use ash::{vk, Entry};
use parking_lot::Mutex;
use raw_window_handle::RawDisplayHandle;
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

use super::tracker::{LifetimeTracker, ObjectId, ObjectKind};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

pub struct Instance {
    pub entry: Entry,
    pub instance: ash::Instance,
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    tracker: Mutex<LifetimeTracker>,
}

impl Instance {
    /// Create the Vulkan instance for a window living on `display_handle`.
    ///
    /// Validation is requested by the caller but only enabled when the
    /// Khronos layer is installed; otherwise we warn and continue without it.
    pub fn new(
        app_name: &str,
        display_handle: RawDisplayHandle,
        enable_validation: bool,
    ) -> Result<Arc<Self>> {
        log::debug!("Creating Vulkan instance for {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let app_name_cstr = CString::new(app_name)?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&app_name_cstr)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_0);

        let mut extensions: Vec<*const c_char> =
            ash_window::enumerate_required_extensions(display_handle)
                .context("Failed to query window-system surface extensions")?
                .to_vec();

        let validation = enable_validation && Self::validation_layer_available(&entry)?;
        if enable_validation && !validation {
            log::warn!("Validation requested but {:?} is not installed", VALIDATION_LAYER);
        }
        if validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        for &name in &extensions {
            log::debug!("Required instance extension: {:?}", unsafe { CStr::from_ptr(name) });
        }

        let layer_names = if validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        let mut tracker = LifetimeTracker::new();
        tracker.created(ObjectId::new(ObjectKind::Instance, instance.handle().as_raw()), &[]);

        let debug_utils = if validation {
            let (loader, messenger) = Self::setup_debug_messenger(&entry, &instance)?;
            tracker.created(
                ObjectId::new(ObjectKind::DebugMessenger, messenger.as_raw()),
                &[ObjectId::new(ObjectKind::Instance, instance.handle().as_raw())],
            );
            log::debug!("Vulkan debug messenger created");
            Some((loader, messenger))
        } else {
            None
        };

        log::info!("Vulkan instance created (validation: {})", validation);

        Ok(Arc::new(Self {
            entry,
            instance,
            debug_utils,
            tracker: Mutex::new(tracker),
        }))
    }

    fn validation_layer_available(entry: &Entry) -> Result<bool> {
        let layers = entry
            .enumerate_instance_layer_properties()
            .context("Failed to enumerate instance layers")?;

        Ok(layers.iter().any(|layer| {
            let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
            name == VALIDATION_LAYER
        }))
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    pub fn id(&self) -> ObjectId {
        ObjectId::new(ObjectKind::Instance, self.instance.handle().as_raw())
    }

    /// Report a newly created handle to the lifetime tracker.
    pub fn track(&self, kind: ObjectKind, raw: u64, parents: &[ObjectId]) -> ObjectId {
        let id = ObjectId::new(kind, raw);
        self.tracker.lock().created(id, parents);
        id
    }

    /// Report a destroyed handle to the lifetime tracker.
    pub fn untrack(&self, id: ObjectId) {
        self.tracker.lock().released(id);
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        log::debug!("Destroying Vulkan instance");

        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
                self.tracker
                    .lock()
                    .released(ObjectId::new(ObjectKind::DebugMessenger, messenger.as_raw()));
            }

            let id = self.id();
            self.tracker.lock().released(id);
            self.instance.destroy_instance(None);
        }

        let tracker = self.tracker.lock();
        if tracker.live_count() > 0 {
            log::error!("{} Vulkan objects outlived the instance", tracker.live_count());
        }
        for violation in tracker.violations() {
            log::error!("Vulkan object lifetime violation: {:?}", violation);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

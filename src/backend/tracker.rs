// Object lifetime tracker
//
// Every Vulkan handle the backend creates is registered here together with the
// handles it depends on. Releasing an object whose parent is already gone, or
// that still has live children, is recorded as a violation instead of silently
// reaching the driver as a use-after-free.

use std::collections::HashMap;

/// Kind of tracked object, used to tell handles with equal raw values apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Instance,
    DebugMessenger,
    Surface,
    Device,
    CommandPool,
    CommandBuffer,
    Swapchain,
    ImageView,
    Framebuffer,
    RenderPass,
    DescriptorSetLayout,
    DescriptorPool,
    PipelineLayout,
    Pipeline,
    Buffer,
    Image,
    Sampler,
    Semaphore,
    Fence,
}

/// Identity of a tracked object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId {
    pub kind: ObjectKind,
    pub raw: u64,
}

impl ObjectId {
    pub const fn new(kind: ObjectKind, raw: u64) -> Self {
        Self { kind, raw }
    }
}

/// A lifetime rule that was broken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// Released an object that was never registered or is already released.
    UnknownRelease(ObjectId),
    /// Released an object after one of its parents.
    ParentReleasedFirst { object: ObjectId, parent: ObjectId },
    /// Released an object while children still reference it.
    ReleasedWithLiveChildren { object: ObjectId, children: usize },
    /// Created an object whose parent is not alive.
    CreatedFromDeadParent { object: ObjectId, parent: ObjectId },
}

#[derive(Debug)]
struct Entry {
    parents: Vec<ObjectId>,
    live_children: usize,
}

#[derive(Debug, Default)]
pub struct LifetimeTracker {
    live: HashMap<ObjectId, Entry>,
    violations: Vec<Violation>,
}

impl LifetimeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly created object and the objects it depends on.
    ///
    /// Parents are handles that must outlive `object`. Handles only consumed
    /// at creation time, such as the render pass of a framebuffer, are not.
    pub fn created(&mut self, object: ObjectId, parents: &[ObjectId]) {
        for parent in parents {
            match self.live.get_mut(parent) {
                Some(entry) => entry.live_children += 1,
                None => self.violations.push(Violation::CreatedFromDeadParent {
                    object,
                    parent: *parent,
                }),
            }
        }

        let parents = parents
            .iter()
            .copied()
            .filter(|parent| self.live.contains_key(parent))
            .collect();

        log::trace!("tracker: created {:?} {:#x}", object.kind, object.raw);
        self.live.insert(
            object,
            Entry {
                parents,
                live_children: 0,
            },
        );
    }

    /// Record that an object has been destroyed.
    pub fn released(&mut self, object: ObjectId) {
        let Some(entry) = self.live.remove(&object) else {
            self.violations.push(Violation::UnknownRelease(object));
            return;
        };

        if entry.live_children > 0 {
            self.violations.push(Violation::ReleasedWithLiveChildren {
                object,
                children: entry.live_children,
            });
        }

        for parent in entry.parents {
            match self.live.get_mut(&parent) {
                Some(parent_entry) => {
                    parent_entry.live_children = parent_entry.live_children.saturating_sub(1)
                }
                None => self
                    .violations
                    .push(Violation::ParentReleasedFirst { object, parent }),
            }
        }

        log::trace!("tracker: released {:?} {:#x}", object.kind, object.raw);
    }

    #[cfg(test)]
    pub fn is_live(&self, object: ObjectId) -> bool {
        self.live.contains_key(&object)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(kind: ObjectKind, raw: u64) -> ObjectId {
        ObjectId::new(kind, raw)
    }

    /// A graph shaped like the renderer's, with a children-first release order.
    fn build_graph(tracker: &mut LifetimeTracker) -> Vec<ObjectId> {
        let instance = id(ObjectKind::Instance, 1);
        let messenger = id(ObjectKind::DebugMessenger, 2);
        let surface = id(ObjectKind::Surface, 3);
        let device = id(ObjectKind::Device, 4);
        let pool = id(ObjectKind::CommandPool, 5);
        let swapchain = id(ObjectKind::Swapchain, 6);
        let views = [id(ObjectKind::ImageView, 7), id(ObjectKind::ImageView, 8)];
        let render_pass = id(ObjectKind::RenderPass, 9);
        let depth_image = id(ObjectKind::Image, 10);
        let depth_view = id(ObjectKind::ImageView, 11);
        let framebuffers = [id(ObjectKind::Framebuffer, 12), id(ObjectKind::Framebuffer, 13)];
        let set_layout = id(ObjectKind::DescriptorSetLayout, 14);
        let pipeline_layout = id(ObjectKind::PipelineLayout, 15);
        let pipeline = id(ObjectKind::Pipeline, 16);
        let descriptor_pool = id(ObjectKind::DescriptorPool, 17);
        let vertex_buffer = id(ObjectKind::Buffer, 18);
        let semaphore = id(ObjectKind::Semaphore, 19);
        let fence = id(ObjectKind::Fence, 20);

        tracker.created(instance, &[]);
        tracker.created(messenger, &[instance]);
        tracker.created(surface, &[instance]);
        tracker.created(device, &[instance]);
        tracker.created(pool, &[device]);
        tracker.created(swapchain, &[device, surface]);
        for view in views {
            tracker.created(view, &[device, swapchain]);
        }
        tracker.created(render_pass, &[device]);
        tracker.created(depth_image, &[device]);
        tracker.created(depth_view, &[device, depth_image]);
        for (framebuffer, view) in framebuffers.iter().zip(views) {
            tracker.created(*framebuffer, &[device, view, depth_view]);
        }
        tracker.created(set_layout, &[device]);
        tracker.created(pipeline_layout, &[device]);
        tracker.created(pipeline, &[device]);
        tracker.created(descriptor_pool, &[device]);
        tracker.created(vertex_buffer, &[device]);
        tracker.created(semaphore, &[device]);
        tracker.created(fence, &[device]);

        // Children before parents
        let mut order = vec![vertex_buffer, semaphore, fence];
        order.extend([descriptor_pool, set_layout, pipeline, pipeline_layout, render_pass]);
        order.extend(framebuffers);
        order.extend([depth_view, depth_image]);
        order.extend(views);
        order.extend([swapchain, pool, device, messenger, surface, instance]);
        order
    }

    #[test]
    fn test_children_first_release_has_no_violations() {
        let mut tracker = LifetimeTracker::new();
        let order = build_graph(&mut tracker);

        for object in order {
            tracker.released(object);
        }

        assert!(tracker.violations().is_empty(), "{:?}", tracker.violations());
        assert_eq!(tracker.live_count(), 0);
    }

    #[test]
    fn test_destroying_device_first_is_flagged() {
        let mut tracker = LifetimeTracker::new();
        let mut order = build_graph(&mut tracker);
        let device = id(ObjectKind::Device, 4);
        order.retain(|object| *object != device);
        order.insert(0, device);

        for object in order {
            tracker.released(object);
        }

        assert!(tracker
            .violations()
            .iter()
            .any(|v| matches!(v, Violation::ReleasedWithLiveChildren { object, .. } if *object == device)));
        assert!(tracker
            .violations()
            .iter()
            .any(|v| matches!(v, Violation::ParentReleasedFirst { parent, .. } if *parent == device)));
    }

    #[test]
    fn test_swapchain_before_framebuffers_is_flagged() {
        let mut tracker = LifetimeTracker::new();
        build_graph(&mut tracker);
        let view = id(ObjectKind::ImageView, 7);

        tracker.released(view);

        assert_eq!(
            tracker.violations(),
            &[Violation::ReleasedWithLiveChildren { object: view, children: 1 }]
        );
    }

    #[test]
    fn test_double_release_is_flagged() {
        let mut tracker = LifetimeTracker::new();
        let fence = id(ObjectKind::Fence, 1);
        tracker.created(fence, &[]);
        tracker.released(fence);
        tracker.released(fence);

        assert_eq!(tracker.violations(), &[Violation::UnknownRelease(fence)]);
    }

    #[test]
    fn test_create_from_dead_parent_is_flagged() {
        let mut tracker = LifetimeTracker::new();
        let device = id(ObjectKind::Device, 1);
        let buffer = id(ObjectKind::Buffer, 2);

        tracker.created(buffer, &[device]);

        assert_eq!(
            tracker.violations(),
            &[Violation::CreatedFromDeadParent { object: buffer, parent: device }]
        );
        assert!(tracker.is_live(buffer));
    }
}

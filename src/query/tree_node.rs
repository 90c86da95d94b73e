use std::sync::Arc;

/// Immutable trees rewritten by building new nodes only where something changed.
pub trait TreeNode: Sized {
    /// Returns the children of this node.
    fn children(&self) -> Vec<Arc<Self>>;

    /// Returns a copy of this node using the given children.
    fn with_new_children(self: Arc<Self>, children: Vec<Arc<Self>>) -> Arc<Self>;

    /// Rewrites the children first, then the node itself.
    fn transform_up<F>(self: Arc<Self>, transform_fn: &F) -> Arc<Self>
    where
        F: Fn(Arc<Self>) -> Arc<Self>,
    {
        let children = self.children();
        if children.is_empty() {
            return transform_fn(self);
        }

        let mut changed = false;
        let transformed: Vec<Arc<Self>> = children
            .into_iter()
            .map(|child| {
                let new_child = child.clone().transform_up(transform_fn);
                changed |= !Arc::ptr_eq(&new_child, &child);
                new_child
            })
            .collect();

        if changed {
            transform_fn(self.with_new_children(transformed))
        } else {
            transform_fn(self)
        }
    }

    /// Rewrites the node first, then the children of the rewritten node.
    fn transform_down<F>(self: Arc<Self>, transform_fn: &F) -> Arc<Self>
    where
        F: Fn(Arc<Self>) -> Arc<Self>,
    {
        let node = transform_fn(self);
        let children = node.children();
        if children.is_empty() {
            return node;
        }

        let mut changed = false;
        let transformed: Vec<Arc<Self>> = children
            .into_iter()
            .map(|child| {
                let new_child = child.clone().transform_down(transform_fn);
                changed |= !Arc::ptr_eq(&new_child, &child);
                new_child
            })
            .collect();

        if changed {
            node.with_new_children(transformed)
        } else {
            node
        }
    }
}

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum View {
    Color,
    Depth,
    Infrared,
    Transformation,
    PointCloud,
    IndexMap,
    Skeleton,
}

impl View {
    pub fn name(self) -> &'static str {
        match self {
            View::Color => "color",
            View::Depth => "depth",
            View::Infrared => "infrared",
            View::Transformation => "transformation",
            View::PointCloud => "point-cloud",
            View::IndexMap => "index-map",
            View::Skeleton => "skeleton",
        }
    }

    /// Window titles this view presents, before the source label is added.
    pub fn windows(self) -> &'static [&'static str] {
        match self {
            View::Color => &["color"],
            View::Depth => &["depth"],
            View::Infrared => &["infrared"],
            View::Transformation => &["transformed color", "transformed depth"],
            View::PointCloud => &["point cloud"],
            View::IndexMap => &["body index map", "transformed body index map"],
            View::Skeleton => &["skeleton"],
        }
    }

    pub fn needs_tracking(self) -> bool {
        matches!(self, View::IndexMap | View::Skeleton)
    }

    pub fn needs_transformer(self) -> bool {
        matches!(
            self,
            View::Transformation | View::PointCloud | View::IndexMap
        )
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered, duplicate-free selection of views.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViewSet {
    views: Vec<View>,
}

impl ViewSet {
    pub fn new(views: impl IntoIterator<Item = View>) -> Self {
        let mut unique = Vec::new();
        for view in views {
            if !unique.contains(&view) {
                unique.push(view);
            }
        }
        Self { views: unique }
    }

    pub fn contains(&self, view: View) -> bool {
        self.views.contains(&view)
    }

    pub fn iter(&self) -> impl Iterator<Item = View> + '_ {
        self.views.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn needs_tracking(&self) -> bool {
        self.iter().any(View::needs_tracking)
    }

    pub fn needs_transformer(&self) -> bool {
        self.iter().any(View::needs_transformer)
    }

    pub fn window_labels(&self, source_label: &str) -> Vec<String> {
        self.iter()
            .flat_map(|view| view.windows().iter())
            .map(|window| format!("{window} ({source_label})"))
            .collect()
    }
}

impl Default for ViewSet {
    fn default() -> Self {
        Self::new([View::Color, View::Depth])
    }
}

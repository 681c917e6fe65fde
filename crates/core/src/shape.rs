use std::fmt;

/// Extents of a tensor: width, height, depth and batch (or time) multiplicity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Shape {
    pub x: usize,
    pub y: usize,
    pub z: usize,
    pub w: usize,
}

impl Shape {
    pub const fn new(x: usize, y: usize, z: usize, w: usize) -> Self {
        Self { x, y, z, w }
    }

    pub const fn d1(x: usize) -> Self {
        Self::new(x, 1, 1, 1)
    }

    pub const fn d2(x: usize, y: usize) -> Self {
        Self::new(x, y, 1, 1)
    }

    pub const fn d3(x: usize, y: usize, z: usize) -> Self {
        Self::new(x, y, z, 1)
    }

    pub fn elements(&self) -> usize {
        self.x * self.y * self.z * self.w
    }

    /// Elements of one batch row (everything but `w`).
    pub fn row_elements(&self) -> usize {
        self.x * self.y * self.z
    }

    pub fn bytes(&self) -> usize {
        self.elements() * std::mem::size_of::<f32>()
    }

    pub fn with_w(mut self, w: usize) -> Self {
        self.w = w;
        self
    }

    pub fn max(&self, other: &Shape) -> Shape {
        Shape::new(
            self.x.max(other.x),
            self.y.max(other.y),
            self.z.max(other.z),
            self.w.max(other.w),
        )
    }
}

impl Default for Shape {
    fn default() -> Self {
        Self::new(1, 1, 1, 1)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {}, {})", self.x, self.y, self.z, self.w)
    }
}

mod vtk;

pub use vtk::vtk_element_dim;
